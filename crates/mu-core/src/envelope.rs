use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{AssuranceTier, Channel};

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Canonical post-verification form of one adapter request.
///
/// Adapters produce exactly this after signature verification and payload
/// normalization; everything downstream (idempotency, policy, journal) works
/// from these fields and never from the raw transport payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundEnvelope {
    pub v: u32,
    pub received_at_ms: i64,
    /// Channel-scoped unique id for this request.
    pub request_id: String,
    /// Transport-scoped delivery id (Slack retry header, Telegram update id, …).
    pub delivery_id: String,
    pub channel: Channel,
    pub channel_tenant_id: String,
    pub channel_conversation_id: String,
    pub actor_id: String,
    pub actor_binding_id: String,
    pub assurance_tier: AssuranceTier,
    pub repo_root: String,
    pub command_text: String,
    pub scope_required: String,
    pub scope_effective: String,
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub idempotency_key: String,
    pub fingerprint: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InboundEnvelope {
    /// Schema check applied before the pipeline touches an envelope.
    /// Adapters construct envelopes themselves, but synthetic wakes and tests
    /// go through here too.
    pub fn validate(&self) -> Result<(), String> {
        if self.v != ENVELOPE_VERSION {
            return Err(format!("unsupported envelope version {}", self.v));
        }
        for (name, value) in [
            ("request_id", &self.request_id),
            ("delivery_id", &self.delivery_id),
            ("actor_id", &self.actor_id),
            ("actor_binding_id", &self.actor_binding_id),
            ("repo_root", &self.repo_root),
            ("command_text", &self.command_text),
            ("idempotency_key", &self.idempotency_key),
            ("fingerprint", &self.fingerprint),
        ] {
            if value.trim().is_empty() {
                return Err(format!("envelope field {name} is empty"));
            }
        }
        Ok(())
    }
}

/// Collapse runs of whitespace and trim — the canonical text form that feeds
/// the fingerprint, so retries with cosmetic spacing differences still
/// deduplicate.
pub fn normalize_command_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic content hash: hex SHA-256 over the canonical fields joined
/// with `\n`. Two requests with the same idempotency key but different
/// fingerprints are a conflict, not a duplicate.
pub fn fingerprint(
    channel: Channel,
    tenant: &str,
    conversation: &str,
    actor: &str,
    command_text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(tenant.as_bytes());
    hasher.update(b"\n");
    hasher.update(conversation.as_bytes());
    hasher.update(b"\n");
    hasher.update(actor.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_command_text(command_text).as_bytes());
    hex::encode(hasher.finalize())
}
