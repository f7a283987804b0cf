//! Discord interaction ingress. JSON payload with the analogous header pair
//! to Slack: `x-discord-signature` + `x-discord-request-timestamp`.

use std::collections::HashMap;

use mu_core::{Channel, InboundEnvelope};

use crate::error::{AdapterError, Result};
use crate::set::{build_envelope, BindingLookup};
use crate::verify::verify_timestamped_hmac;

pub const SIGNATURE_HEADER: &str = "x-discord-signature";
pub const TIMESTAMP_HEADER: &str = "x-discord-request-timestamp";

pub struct DiscordAdapter {
    signing_secret: String,
}

impl DiscordAdapter {
    pub fn new(signing_secret: String) -> Self {
        Self { signing_secret }
    }

    pub fn verify_and_normalize(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
        now_ms: i64,
        repo_root: &str,
        bindings: &dyn BindingLookup,
    ) -> Result<InboundEnvelope> {
        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .ok_or_else(|| AdapterError::SignatureInvalid("missing timestamp header".to_string()))?;
        let signature = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| AdapterError::SignatureInvalid("missing signature header".to_string()))?;
        verify_timestamped_hmac(&self.signing_secret, timestamp, signature, body, now_ms)?;

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AdapterError::PayloadInvalid(format!("invalid JSON: {e}")))?;

        let interaction_id = string_at(&payload, &["id"])
            .ok_or_else(|| AdapterError::PayloadInvalid("missing interaction id".to_string()))?;
        let guild = string_at(&payload, &["guild_id"]).unwrap_or_else(|| "dm".to_string());
        let channel_id = string_at(&payload, &["channel_id"])
            .ok_or_else(|| AdapterError::PayloadInvalid("missing channel_id".to_string()))?;
        let user = string_at(&payload, &["member", "user", "id"])
            .or_else(|| string_at(&payload, &["user", "id"]))
            .ok_or_else(|| AdapterError::PayloadInvalid("missing user id".to_string()))?;
        // Slash commands put the operator text in data.options[0].value;
        // plain relays put it in content.
        let text = payload
            .pointer("/data/options/0/value")
            .and_then(|v| v.as_str())
            .map(|t| format!("/mu {t}"))
            .or_else(|| string_at(&payload, &["content"]))
            .ok_or_else(|| AdapterError::PayloadInvalid("missing command text".to_string()))?;

        build_envelope(
            Channel::Discord,
            &guild,
            &channel_id,
            &user,
            &text,
            &interaction_id,
            &interaction_id,
            &format!("discord:{interaction_id}"),
            now_ms,
            repo_root,
            bindings,
        )
    }
}

fn string_at(value: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_str().map(|s| s.to_string())
}
