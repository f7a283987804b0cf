use serde::{Deserialize, Serialize};

/// A periodic operator wake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatProgram {
    pub program_id: String,
    pub title: String,
    pub every_ms: i64,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// When a cron program fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// One-shot at an absolute epoch instant.
    At { at_ms: i64 },
    /// Fixed interval anchored at `anchor_ms`; fires on anchor multiples.
    Every { every_ms: i64, anchor_ms: i64 },
    /// 5-field minute-resolution cron expression, optional fixed-offset tz.
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronProgram {
    pub program_id: String,
    pub title: String,
    pub schedule: CronSchedule,
    /// What the wake asks the operator to do.
    pub target: String,
    pub enabled: bool,
    pub wake_mode: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Outcome of one dispatched wake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WakeStatus {
    Ok,
    Coalesced { reason: String },
    Failed { reason: String },
}

/// Last observed tick of a program, kept for the status surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub program_id: String,
    pub at_ms: i64,
    pub status: WakeStatus,
}
