//! Telegram webhook ingress. Update JSON, authenticated by exact match of
//! `x-telegram-bot-api-secret-token` against the configured webhook secret.

use std::collections::HashMap;

use mu_core::{Channel, InboundEnvelope};

use crate::error::{AdapterError, Result};
use crate::set::{build_envelope, BindingLookup};
use crate::verify::verify_shared_secret;

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub struct TelegramAdapter {
    webhook_secret: String,
}

impl TelegramAdapter {
    pub fn new(webhook_secret: String) -> Self {
        Self { webhook_secret }
    }

    pub fn verify_and_normalize(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
        now_ms: i64,
        repo_root: &str,
        bindings: &dyn BindingLookup,
    ) -> Result<InboundEnvelope> {
        verify_shared_secret(&self.webhook_secret, headers.get(SECRET_HEADER).map(|s| s.as_str()))?;

        let update: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AdapterError::PayloadInvalid(format!("invalid JSON: {e}")))?;

        let update_id = update
            .get("update_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| AdapterError::PayloadInvalid("missing update_id".to_string()))?;
        let message = update
            .get("message")
            .or_else(|| update.get("edited_message"))
            .ok_or_else(|| AdapterError::PayloadInvalid("update carries no message".to_string()))?;
        let chat_id = message
            .pointer("/chat/id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| AdapterError::PayloadInvalid("missing chat id".to_string()))?;
        let from_id = message
            .pointer("/from/id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| AdapterError::PayloadInvalid("missing sender id".to_string()))?;
        let text = message
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::PayloadInvalid("message has no text".to_string()))?;

        build_envelope(
            Channel::Telegram,
            // Telegram has no tenant concept; the bot chat is the tenant.
            &chat_id.to_string(),
            &chat_id.to_string(),
            &from_id.to_string(),
            text,
            &update_id.to_string(),
            &update_id.to_string(),
            &format!("telegram:{chat_id}:{update_id}"),
            now_ms,
            repo_root,
            bindings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::AssuranceTier;

    struct NoBindings;
    impl BindingLookup for NoBindings {
        fn lookup(&self, _channel: Channel, _actor_id: &str) -> Option<(String, AssuranceTier)> {
            None
        }
    }

    fn update() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "update_id": 4242,
            "message": {
                "message_id": 7,
                "chat": { "id": -100123 },
                "from": { "id": 555, "username": "ada" },
                "text": "/mu ready",
            },
        }))
        .unwrap()
    }

    fn secret_headers(token: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(SECRET_HEADER.to_string(), token.to_string());
        headers
    }

    #[test]
    fn valid_secret_normalizes_update() {
        let adapter = TelegramAdapter::new("tok".to_string());
        let env = adapter
            .verify_and_normalize(&secret_headers("tok"), &update(), 1_000, "/repo", &NoBindings)
            .unwrap();
        assert_eq!(env.channel, Channel::Telegram);
        assert_eq!(env.channel_conversation_id, "-100123");
        assert_eq!(env.actor_id, "555");
        assert_eq!(env.target_type, "ready");
        assert_eq!(env.idempotency_key, "telegram:-100123:4242");
    }

    #[test]
    fn wrong_or_missing_secret_is_401() {
        let adapter = TelegramAdapter::new("tok".to_string());
        assert_eq!(
            adapter
                .verify_and_normalize(&secret_headers("bad"), &update(), 1_000, "/repo", &NoBindings)
                .unwrap_err()
                .http_status(),
            401
        );
        assert_eq!(
            adapter
                .verify_and_normalize(&HashMap::new(), &update(), 1_000, "/repo", &NoBindings)
                .unwrap_err()
                .http_status(),
            401
        );
    }

    #[test]
    fn update_without_text_is_payload_invalid() {
        let adapter = TelegramAdapter::new("tok".to_string());
        let body = serde_json::to_vec(&serde_json::json!({
            "update_id": 1,
            "message": { "chat": {"id": 1}, "from": {"id": 2} },
        }))
        .unwrap();
        let err = adapter
            .verify_and_normalize(&secret_headers("tok"), &body, 1_000, "/repo", &NoBindings)
            .unwrap_err();
        assert_eq!(err.code(), "adapter_payload_invalid");
    }
}
