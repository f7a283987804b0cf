//! Core vocabulary of the mu control plane: identifiers, the inbound
//! envelope, the durable command record and its state machine, the command
//! surface table, the injected clock, and configuration.
//!
//! Everything persisted or sent over the wire lives here so the other crates
//! agree on one serde representation.

pub mod clock;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod surface;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandRecord, CommandState, TransitionOptions};
pub use config::MuConfig;
pub use envelope::InboundEnvelope;
pub use error::{CoreError, Result};
pub use types::{AssuranceTier, Channel};
