//! The run supervisor: one subprocess per orchestration run, streamed line
//! by line into bounded buffers, interruptible with SIGINT-then-SIGKILL,
//! with sequence-numbered events forwarded for outbox delivery.

pub mod error;
pub mod parse;
pub mod supervisor;
pub mod types;

pub use error::{Result, RunError};
pub use supervisor::{InterruptOutcome, LaunchOptions, RunSupervisor};
pub use types::{
    ControlPlaneRunEvent, RunEventType, RunMode, RunRoute, RunSnapshot, RunSource, RunStatus,
};
