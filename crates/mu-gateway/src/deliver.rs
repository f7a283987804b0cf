//! Outbound transport. The rendering contract is the outbox's; this is the
//! per-channel HTTP call. Telegram delivers through the bot API with a
//! MarkdownV2/plain-text fallback; channels without configured transport
//! credentials are logged and acknowledged so development deployments do
//! not dead-letter every reply.

use async_trait::async_trait;
use tracing::{info, warn};

use mu_adapters::markdown;
use mu_core::Channel;
use mu_outbox::{Deliverer, DeliveryOutcome, OutboundEnvelope};

pub struct ChannelDeliverer {
    http: reqwest::Client,
    telegram_bot_token: Option<String>,
}

impl ChannelDeliverer {
    pub fn new(telegram_bot_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            telegram_bot_token,
        }
    }

    async fn deliver_telegram(&self, token: &str, envelope: &OutboundEnvelope) -> DeliveryOutcome {
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let (body, parse_mode) = markdown::prepare_body(&envelope.body);

        let mut payload = serde_json::json!({
            "chat_id": envelope.channel_conversation_id,
            "text": body,
        });
        if let Some(mode) = parse_mode {
            payload["parse_mode"] = serde_json::Value::String(mode.to_string());
        }

        match self.http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => DeliveryOutcome::Delivered,
            Ok(resp) if resp.status().as_u16() == 400 && parse_mode.is_some() => {
                // Formatting rejected — retry this attempt as plain text.
                warn!("telegram rejected markdown; retrying plain");
                let plain = serde_json::json!({
                    "chat_id": envelope.channel_conversation_id,
                    "text": envelope.body,
                });
                match self.http.post(&url).json(&plain).send().await {
                    Ok(resp) if resp.status().is_success() => DeliveryOutcome::Delivered,
                    Ok(resp) => DeliveryOutcome::Retry {
                        error: format!("telegram plain fallback http {}", resp.status()),
                        retry_delay_ms: None,
                    },
                    Err(e) => DeliveryOutcome::Retry {
                        error: format!("telegram plain fallback: {e}"),
                        retry_delay_ms: None,
                    },
                }
            }
            Ok(resp) => DeliveryOutcome::Retry {
                error: format!("telegram http {}", resp.status()),
                retry_delay_ms: None,
            },
            Err(e) => DeliveryOutcome::Retry {
                error: format!("telegram send: {e}"),
                retry_delay_ms: None,
            },
        }
    }
}

#[async_trait]
impl Deliverer for ChannelDeliverer {
    async fn deliver(&self, envelope: &OutboundEnvelope) -> DeliveryOutcome {
        match (envelope.channel, self.telegram_bot_token.as_deref()) {
            (Channel::Telegram, Some(token)) => self.deliver_telegram(token, envelope).await,
            _ => {
                info!(
                    channel = %envelope.channel,
                    conversation = %envelope.channel_conversation_id,
                    kind = ?envelope.kind,
                    "delivery transport not configured; logged"
                );
                DeliveryOutcome::Delivered
            }
        }
    }
}
