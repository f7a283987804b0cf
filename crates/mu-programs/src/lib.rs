//! Scheduled operator wakes: heartbeat programs (fixed period) and cron
//! programs (absolute, anchored-interval, or 5-field cron expressions).
//! Each tick dispatches a deduplicated wake through a host-supplied seam.

pub mod cron;
pub mod error;
pub mod registry;
pub mod types;

pub use cron::{next_cron_fire, parse_cron_expr, CronExpr};
pub use error::{ProgramError, Result};
pub use registry::{CronProgramRegistry, HeartbeatProgramRegistry, WakeDispatcher, WakeRequest};
pub use types::{CronProgram, CronSchedule, HeartbeatProgram, TickRecord, WakeStatus};
