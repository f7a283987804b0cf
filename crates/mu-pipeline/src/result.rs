use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use mu_core::{CommandRecord, CommandState};

/// What one inbound request resolved to. Adapters render the compact ACK
/// from this; the detailed body travels through the outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    Accepted {
        command_id: String,
    },
    AwaitingConfirmation {
        command_id: String,
        expires_at_ms: i64,
    },
    Completed {
        command_id: String,
        result: serde_json::Value,
    },
    Failed {
        command_id: String,
        error_code: String,
    },
    Cancelled {
        command_id: String,
    },
    Expired {
        command_id: String,
    },
    Denied {
        reason: String,
        detail: String,
    },
    Deferred {
        command_id: String,
        retry_at_ms: i64,
    },
}

impl PipelineResult {
    /// Outcome word shown in the compact ACK.
    pub fn state_str(&self) -> &'static str {
        match self {
            PipelineResult::Accepted { .. } => "accepted",
            PipelineResult::AwaitingConfirmation { .. } => "awaiting_confirmation",
            PipelineResult::Completed { .. } => "completed",
            PipelineResult::Failed { .. } => "failed",
            PipelineResult::Cancelled { .. } => "cancelled",
            PipelineResult::Expired { .. } => "expired",
            PipelineResult::Denied { .. } => "denied",
            PipelineResult::Deferred { .. } => "deferred",
        }
    }

    pub fn command_id(&self) -> Option<&str> {
        match self {
            PipelineResult::Accepted { command_id }
            | PipelineResult::AwaitingConfirmation { command_id, .. }
            | PipelineResult::Completed { command_id, .. }
            | PipelineResult::Failed { command_id, .. }
            | PipelineResult::Cancelled { command_id }
            | PipelineResult::Expired { command_id }
            | PipelineResult::Deferred { command_id, .. } => Some(command_id),
            PipelineResult::Denied { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PipelineResult::Denied { reason, .. } => Some(reason),
            PipelineResult::Failed { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    /// Map a journaled record's current state back to a result — used when a
    /// duplicate or a confirm of an already-settled command replays the
    /// original presentation.
    pub fn from_record(record: &CommandRecord) -> Self {
        match record.state {
            CommandState::Accepted | CommandState::Queued | CommandState::InProgress => {
                PipelineResult::Accepted {
                    command_id: record.command_id.0.clone(),
                }
            }
            CommandState::AwaitingConfirmation => PipelineResult::AwaitingConfirmation {
                command_id: record.command_id.0.clone(),
                expires_at_ms: record.confirmation_expires_at_ms.unwrap_or_default(),
            },
            CommandState::Deferred => PipelineResult::Deferred {
                command_id: record.command_id.0.clone(),
                retry_at_ms: record.retry_at_ms.unwrap_or_default(),
            },
            CommandState::Completed => PipelineResult::Completed {
                command_id: record.command_id.0.clone(),
                result: record.result.clone().unwrap_or(serde_json::Value::Null),
            },
            CommandState::Failed | CommandState::DeadLetter => PipelineResult::Failed {
                command_id: record.command_id.0.clone(),
                error_code: record
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "replay_handler_error".to_string()),
            },
            CommandState::Cancelled => PipelineResult::Cancelled {
                command_id: record.command_id.0.clone(),
            },
            CommandState::Expired => PipelineResult::Expired {
                command_id: record.command_id.0.clone(),
            },
        }
    }
}

/// Pipeline-level counters surfaced on the status endpoint.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub accepted_total: AtomicU64,
    pub completed_total: AtomicU64,
    pub failed_total: AtomicU64,
    pub denied_total: AtomicU64,
    pub deferred_total: AtomicU64,
    pub duplicate_total: AtomicU64,
    pub expired_total: AtomicU64,
    pub cancelled_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineCountersSnapshot {
    pub accepted_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub denied_total: u64,
    pub deferred_total: u64,
    pub duplicate_total: u64,
    pub expired_total: u64,
    pub cancelled_total: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> PipelineCountersSnapshot {
        PipelineCountersSnapshot {
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            denied_total: self.denied_total.load(Ordering::Relaxed),
            deferred_total: self.deferred_total.load(Ordering::Relaxed),
            duplicate_total: self.duplicate_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
        }
    }
}
