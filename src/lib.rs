//! Drowsiness agent
//!
//! Samples a frame source on a fixed interval, sends each frame to a remote
//! classifier, and raises a sticky alarm once enough consecutive frames come
//! back CLOSED or YAWN.

pub mod agent;
pub mod alert;
pub mod classifier;
pub mod config;
pub mod error;
pub mod frame;
pub mod scheduler;
pub mod types;

pub use error::{AgentError, AgentResult};
pub use scheduler::Scheduler;
pub use types::{Observation, ObservationState, StatusSnapshot, SystemState};
