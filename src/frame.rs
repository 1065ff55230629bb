//! Frame sources: where the scheduler gets the still image to classify.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// An encoded still image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl Frame {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: "image/jpeg".to_string(),
        }
    }
}

/// Produces the most recent sensor capture.
///
/// Both methods are called from the scheduler and must not block for long.
pub trait FrameSource: Send + Sync {
    /// Whether a frame can be produced at all. Checked once by `start()`.
    fn is_ready(&self) -> bool;

    /// The current frame, or `None` if nothing is available right now.
    fn current_frame(&self) -> Option<Frame>;
}

/// A single-slot buffer that a capture producer publishes into.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: RwLock<Option<Frame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    /// Drops the held frame, e.g. when the feed is lost.
    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl FrameSource for LatestFrame {
    fn is_ready(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current_frame(&self) -> Option<Frame> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Reads a snapshot image that an external grabber keeps overwriting.
#[derive(Debug, Clone)]
pub struct FileFrameSource {
    path: PathBuf,
    mime_type: String,
}

impl FileFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mime_type = mime_for_path(&path).to_string();
        Self { path, mime_type }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for FileFrameSource {
    fn is_ready(&self) -> bool {
        self.path.is_file()
    }

    fn current_frame(&self) -> Option<Frame> {
        match fs_err::read(&self.path) {
            Ok(data) if !data.is_empty() => Some(Frame {
                data,
                mime_type: self.mime_type.clone(),
            }),
            Ok(_) => {
                debug!(path = %self.path.display(), "Frame file is empty");
                None
            }
            Err(err) => {
                debug!(error = %err, "Frame file unavailable");
                None
            }
        }
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}
