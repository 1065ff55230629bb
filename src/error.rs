//! Errors that cross the agent boundary.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// `start()` was called before the frame source produced anything.
    #[error("frame source not ready")]
    NotReady,

    /// The classifier call failed; the run has been stopped.
    #[error("failed to analyze frame: {0}")]
    AnalysisFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
