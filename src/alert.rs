//! Alert sinks driven by the alarm edges.

use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Receives the two alarm signals.
///
/// Called while the scheduler holds its state lock: implementations must
/// return quickly and must not call back into the scheduler.
pub trait AlertSink: Send + Sync {
    fn begin_alert(&self);
    fn end_alert(&self);
}

/// Logs alarm edges and nothing else.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn begin_alert(&self) {
        warn!("Drowsiness alert raised");
    }

    fn end_alert(&self) {
        info!("Drowsiness alert cleared");
    }
}

/// Rings the terminal bell in a loop until the alert is ended.
#[derive(Debug)]
pub struct TerminalBell {
    period: Duration,
    ringing: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalBell {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ringing: Mutex::new(None),
        }
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Default for TerminalBell {
    fn default() -> Self {
        Self::new(Duration::from_millis(800))
    }
}

impl AlertSink for TerminalBell {
    /// Must be called from within a tokio runtime.
    fn begin_alert(&self) {
        let mut ringing = self.ringing.lock().unwrap_or_else(PoisonError::into_inner);
        if ringing.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        warn!("Drowsiness alert raised");
        let period = self.period;
        *ringing = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let mut stderr = std::io::stderr();
                let _ = stderr.write_all(b"\x07");
                let _ = stderr.flush();
            }
        }));
    }

    /// Stops the loop; the next alert starts from the first ring.
    fn end_alert(&self) {
        if let Some(handle) = self
            .ringing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("Drowsiness alert cleared");
        }
    }
}

impl Drop for TerminalBell {
    fn drop(&mut self) {
        if let Some(handle) = self
            .ringing
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
