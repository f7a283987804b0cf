use std::collections::HashMap;

use mu_core::config::AdaptersConfig;
use mu_core::envelope::{fingerprint, InboundEnvelope, ENVELOPE_VERSION};
use mu_core::surface;
use mu_core::{AssuranceTier, Channel};

use crate::discord::DiscordAdapter;
use crate::error::{AdapterError, Result};
use crate::neovim::NeovimAdapter;
use crate::slack::SlackAdapter;
use crate::telegram::TelegramAdapter;

/// Declarative description of one adapter's ingress contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneAdapterSpec {
    pub v: u32,
    pub channel: Channel,
    pub route: &'static str,
    pub payload_format: &'static str,
    pub verification: &'static str,
    pub delivery_semantics: &'static str,
}

/// Hot-path lookup from channel actor to a linked binding. The gateway
/// implements this over the identity store.
pub trait BindingLookup: Send + Sync {
    fn lookup(&self, channel: Channel, actor_id: &str) -> Option<(String, AssuranceTier)>;
}

/// Inputs for rendering the immediate compact ACK (the HTTP 200 body).
#[derive(Debug, Clone, Copy)]
pub struct AckContext<'a> {
    pub state: &'a str,
    pub reason: Option<&'a str>,
    pub command_id: Option<&'a str>,
    pub compact: &'a str,
    pub conversation_id: &'a str,
}

/// Fixed sum type over the four ingress channels, each variant carrying its
/// secret material and verifier.
pub enum Adapter {
    Slack(SlackAdapter),
    Discord(DiscordAdapter),
    Telegram(TelegramAdapter),
    Neovim(NeovimAdapter),
}

impl Adapter {
    pub fn spec(&self) -> ControlPlaneAdapterSpec {
        match self {
            Adapter::Slack(_) => ControlPlaneAdapterSpec {
                v: 1,
                channel: Channel::Slack,
                route: "/webhooks/slack",
                payload_format: "form",
                verification: "hmac-sha256-timestamped",
                delivery_semantics: "ack-then-outbox",
            },
            Adapter::Discord(_) => ControlPlaneAdapterSpec {
                v: 1,
                channel: Channel::Discord,
                route: "/webhooks/discord",
                payload_format: "json",
                verification: "hmac-sha256-timestamped",
                delivery_semantics: "ack-then-outbox",
            },
            Adapter::Telegram(_) => ControlPlaneAdapterSpec {
                v: 1,
                channel: Channel::Telegram,
                route: "/webhooks/telegram",
                payload_format: "json",
                verification: "shared-secret-header",
                delivery_semantics: "ack-then-outbox",
            },
            Adapter::Neovim(_) => ControlPlaneAdapterSpec {
                v: 1,
                channel: Channel::Neovim,
                route: "/webhooks/neovim",
                payload_format: "json",
                verification: "shared-secret-header",
                delivery_semantics: "ack-then-outbox",
            },
        }
    }

    pub fn channel(&self) -> Channel {
        self.spec().channel
    }

    /// Verify the request then normalize the payload. 401-class failures
    /// never produce an envelope.
    pub fn verify_and_normalize(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
        now_ms: i64,
        repo_root: &str,
        bindings: &dyn BindingLookup,
    ) -> Result<InboundEnvelope> {
        match self {
            Adapter::Slack(a) => a.verify_and_normalize(headers, body, now_ms, repo_root, bindings),
            Adapter::Discord(a) => a.verify_and_normalize(headers, body, now_ms, repo_root, bindings),
            Adapter::Telegram(a) => a.verify_and_normalize(headers, body, now_ms, repo_root, bindings),
            Adapter::Neovim(a) => a.verify_and_normalize(headers, body, now_ms, repo_root, bindings),
        }
    }

    /// Immediate compact ACK returned as the HTTP 200 body.
    pub fn render_ack(&self, ctx: AckContext<'_>) -> serde_json::Value {
        match self {
            Adapter::Slack(_) => serde_json::json!({
                "response_type": "ephemeral",
                "text": ctx.compact,
            }),
            Adapter::Discord(_) => serde_json::json!({
                "type": 4,
                "data": { "content": ctx.compact, "flags": 64 },
            }),
            // Telegram webhook replies can carry a bot API method; typing
            // keeps the chat responsive while the outbox delivers details.
            Adapter::Telegram(_) => serde_json::json!({
                "method": "sendChatAction",
                "chat_id": ctx.conversation_id,
                "action": "typing",
            }),
            Adapter::Neovim(_) => serde_json::json!({
                "ok": ctx.reason.is_none(),
                "state": ctx.state,
                "command_id": ctx.command_id,
                "reason": ctx.reason,
                "text": ctx.compact,
            }),
        }
    }
}

/// Route → adapter map for one generation. Swapped atomically on reload.
pub struct AdapterSet {
    routes: HashMap<&'static str, Adapter>,
}

impl AdapterSet {
    /// Build from config. Unconfigured adapters (no secret) get no route.
    pub fn from_config(adapters: &AdaptersConfig) -> Self {
        let mut routes: HashMap<&'static str, Adapter> = HashMap::new();

        if let Some(secret) = adapters
            .slack
            .as_ref()
            .and_then(|c| c.signing_secret.clone())
        {
            let adapter = Adapter::Slack(SlackAdapter::new(secret));
            routes.insert(adapter.spec().route, adapter);
        }
        if let Some(secret) = adapters
            .discord
            .as_ref()
            .and_then(|c| c.signing_secret.clone())
        {
            let adapter = Adapter::Discord(DiscordAdapter::new(secret));
            routes.insert(adapter.spec().route, adapter);
        }
        if let Some(secret) = adapters
            .telegram
            .as_ref()
            .and_then(|c| c.webhook_secret.clone())
        {
            let adapter = Adapter::Telegram(TelegramAdapter::new(secret));
            routes.insert(adapter.spec().route, adapter);
        }
        if let Some(secret) = adapters
            .neovim
            .as_ref()
            .and_then(|c| c.shared_secret.clone())
        {
            let adapter = Adapter::Neovim(NeovimAdapter::new(secret));
            routes.insert(adapter.spec().route, adapter);
        }

        Self { routes }
    }

    pub fn by_route(&self, route: &str) -> Option<&Adapter> {
        self.routes.get(route)
    }

    pub fn routes(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self.routes.keys().copied().collect();
        out.sort();
        out
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut out: Vec<Channel> = self.routes.values().map(|a| a.channel()).collect();
        out.sort_by_key(|c| c.as_str());
        out
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Shared envelope assembly once a channel has verified and extracted its
/// transport fields.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_envelope(
    channel: Channel,
    tenant: &str,
    conversation: &str,
    actor: &str,
    command_text: &str,
    request_id: &str,
    delivery_id: &str,
    idempotency_key: &str,
    now_ms: i64,
    repo_root: &str,
    bindings: &dyn BindingLookup,
) -> Result<InboundEnvelope> {
    if command_text.trim().is_empty() {
        return Err(AdapterError::PayloadInvalid("empty command text".to_string()));
    }

    let (actor_binding_id, assurance_tier) = bindings
        .lookup(channel, actor)
        .unwrap_or_else(|| (format!("unlinked:{channel}:{actor}"), AssuranceTier::TierC));

    let (target_type, target_id, scope) = match surface::parse_command_text(command_text) {
        Some(parsed) => {
            let scope = surface::find_key(&parsed.target_type)
                .map(|s| s.primary_scope.to_string())
                .unwrap_or_else(|| "cp.read".to_string());
            (parsed.target_type, parsed.target_id, scope)
        }
        None => (String::new(), None, "cp.read".to_string()),
    };

    Ok(InboundEnvelope {
        v: ENVELOPE_VERSION,
        received_at_ms: now_ms,
        request_id: request_id.to_string(),
        delivery_id: delivery_id.to_string(),
        channel,
        channel_tenant_id: tenant.to_string(),
        channel_conversation_id: conversation.to_string(),
        actor_id: actor.to_string(),
        actor_binding_id,
        assurance_tier,
        repo_root: repo_root.to_string(),
        command_text: command_text.to_string(),
        scope_required: scope.clone(),
        scope_effective: scope,
        target_type,
        target_id,
        idempotency_key: idempotency_key.to_string(),
        fingerprint: fingerprint(channel, tenant, conversation, actor, command_text),
        metadata: serde_json::json!({}),
    })
}
