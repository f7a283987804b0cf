use serde::{Deserialize, Serialize};

use mu_core::types::{Correlation, JobId};
use mu_core::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    RunStart,
    RunResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Command,
    Api,
}

/// Where run events should be delivered; absent for API-launched runs that
/// have no chat conversation behind them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRoute {
    pub channel: Channel,
    pub channel_tenant_id: String,
    pub channel_conversation_id: String,
}

/// Live or historical view of one run job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub job_id: JobId,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_issue_id: Option<String>,
    pub max_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub source: RunSource,
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    RunRootDiscovered,
    RunProgress,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventType::RunStarted => "run_started",
            RunEventType::RunRootDiscovered => "run_root_discovered",
            RunEventType::RunProgress => "run_progress",
            RunEventType::RunCompleted => "run_completed",
            RunEventType::RunFailed => "run_failed",
            RunEventType::RunCancelled => "run_cancelled",
        }
    }
}

/// Sequence-numbered event forwarded to the outbox pump. The dedupe key
/// `run-event:<job>:<seq>` makes delivery at-least-once but presentation
/// exactly-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneRunEvent {
    pub job_id: JobId,
    pub seq: u64,
    pub event_type: RunEventType,
    pub payload: serde_json::Value,
    pub correlation: Correlation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RunRoute>,
    pub at_ms: i64,
}

impl ControlPlaneRunEvent {
    pub fn dedupe_key(&self) -> String {
        format!("run-event:{}:{}", self.job_id, self.seq)
    }
}
