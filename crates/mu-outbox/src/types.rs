use serde::{Deserialize, Serialize};

use mu_core::types::{Channel, Correlation, OutboxId};

/// What kind of outbound message this is; budgets and rendering differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Ack,
    Lifecycle,
    Result,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Ack => "ack",
            EnvelopeKind::Lifecycle => "lifecycle",
            EnvelopeKind::Result => "result",
            EnvelopeKind::Error => "error",
        }
    }
}

/// A rendered reply addressed to one channel conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboundEnvelope {
    pub channel: Channel,
    pub channel_tenant_id: String,
    pub channel_conversation_id: String,
    pub kind: EnvelopeKind,
    /// Presented interaction message body.
    pub body: String,
    #[serde(default)]
    pub correlation: Correlation,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Delivered,
    DeadLetter,
}

/// Durable delivery record. Appended on every state change; the latest row
/// per `outbox_id` wins on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboxRecord {
    pub outbox_id: OutboxId,
    /// Coalescing key — at most one non-dead-letter record per key.
    pub dedupe_key: String,
    pub envelope: OutboundEnvelope,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at_ms: i64,
    pub state: OutboxState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of_outbox_id: Option<String>,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.state == OutboxState::Pending && self.next_attempt_at_ms <= now_ms
    }
}

/// What the transport reported for one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure. `retry_delay_ms` overrides the dispatcher's
    /// exponential backoff when supplied.
    Retry {
        error: String,
        retry_delay_ms: Option<i64>,
    },
    /// Permanent failure — straight to the dead letter queue.
    Drop { reason: String },
}
