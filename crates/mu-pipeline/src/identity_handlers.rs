//! Identity lifecycle handlers: link begin/finish, unlink self, revoke, and
//! scope grants. Binding rows live in the identity store; the journal gets a
//! mutating event per change.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use mu_core::{Clock, CommandRecord};
use mu_identity::{IdentityStore, LinkCodeRegistry};

use crate::handlers::{CommandHandler, HandlerOutcome, ReplayMutationEvent};

pub struct LinkBeginHandler {
    links: Arc<Mutex<LinkCodeRegistry>>,
    clock: Arc<dyn Clock>,
}

impl LinkBeginHandler {
    pub fn new(links: Arc<Mutex<LinkCodeRegistry>>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self { links, clock })
    }
}

#[async_trait]
impl CommandHandler for LinkBeginHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let now = self.clock.now_ms();
        let mut links = self.links.lock().unwrap();
        links.prune(now);
        let pending = links.begin(
            record.channel,
            &record.channel_tenant_id,
            &record.actor_id,
            &record.actor_id,
            now,
        );
        HandlerOutcome::completed_with_events(
            serde_json::json!({
                "link_code": pending.code,
                "expires_at_ms": pending.expires_at_ms,
            }),
            vec![ReplayMutationEvent::new(
                "identity.link_begun",
                serde_json::json!({
                    "channel": record.channel.as_str(),
                    "actor_id": record.actor_id,
                }),
            )],
        )
    }
}

pub struct LinkFinishHandler {
    links: Arc<Mutex<LinkCodeRegistry>>,
    identities: Arc<Mutex<IdentityStore>>,
    clock: Arc<dyn Clock>,
}

impl LinkFinishHandler {
    pub fn new(
        links: Arc<Mutex<LinkCodeRegistry>>,
        identities: Arc<Mutex<IdentityStore>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            links,
            identities,
            clock,
        })
    }
}

#[async_trait]
impl CommandHandler for LinkFinishHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let Some(code) = record.target_id.as_deref() else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        let now = self.clock.now_ms();
        let binding = match self.links.lock().unwrap().finish(code, now) {
            Ok(binding) => binding,
            Err(e) => return HandlerOutcome::failed(e.code()),
        };
        if let Err(e) = self.identities.lock().unwrap().upsert(binding.clone()) {
            return HandlerOutcome::failed(e.code());
        }
        HandlerOutcome::completed_with_events(
            serde_json::json!({
                "binding_id": binding.binding_id,
                "assurance_tier": binding.assurance_tier.as_str(),
                "scopes": binding.scopes,
            }),
            vec![ReplayMutationEvent::new(
                "identity.linked",
                serde_json::json!({
                    "binding_id": binding.binding_id,
                    "channel": binding.channel.as_str(),
                    "actor_id": binding.actor_id,
                }),
            )],
        )
    }
}

pub struct UnlinkSelfHandler {
    identities: Arc<Mutex<IdentityStore>>,
}

impl UnlinkSelfHandler {
    pub fn new(identities: Arc<Mutex<IdentityStore>>) -> Arc<Self> {
        Arc::new(Self { identities })
    }
}

#[async_trait]
impl CommandHandler for UnlinkSelfHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        match self
            .identities
            .lock()
            .unwrap()
            .revoke(&record.actor_binding_id)
        {
            Ok(binding) => HandlerOutcome::completed_with_events(
                serde_json::json!({"binding_id": binding.binding_id, "revoked": true}),
                vec![ReplayMutationEvent::new(
                    "identity.unlinked",
                    serde_json::json!({"binding_id": binding.binding_id}),
                )],
            ),
            Err(e) => HandlerOutcome::failed(e.code()),
        }
    }
}

/// `revoke <binding_id>` — admin removal of someone else's binding.
pub struct RevokeHandler {
    identities: Arc<Mutex<IdentityStore>>,
}

impl RevokeHandler {
    pub fn new(identities: Arc<Mutex<IdentityStore>>) -> Arc<Self> {
        Arc::new(Self { identities })
    }
}

#[async_trait]
impl CommandHandler for RevokeHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let Some(binding_id) = record.target_id.as_deref() else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        match self.identities.lock().unwrap().revoke(binding_id) {
            Ok(binding) => HandlerOutcome::completed_with_events(
                serde_json::json!({"binding_id": binding.binding_id, "revoked": true}),
                vec![ReplayMutationEvent::new(
                    "identity.revoked",
                    serde_json::json!({
                        "binding_id": binding.binding_id,
                        "revoked_by": record.actor_binding_id,
                    }),
                )],
            ),
            Err(e) => HandlerOutcome::failed(e.code()),
        }
    }
}

/// `grant scope <binding_id> <scope>`.
pub struct GrantScopeHandler {
    identities: Arc<Mutex<IdentityStore>>,
}

impl GrantScopeHandler {
    pub fn new(identities: Arc<Mutex<IdentityStore>>) -> Arc<Self> {
        Arc::new(Self { identities })
    }
}

#[async_trait]
impl CommandHandler for GrantScopeHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let (Some(binding_id), Some(scope)) =
            (record.target_id.as_deref(), record.command_args.first())
        else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        match self.identities.lock().unwrap().grant_scope(binding_id, scope) {
            Ok(binding) => HandlerOutcome::completed_with_events(
                serde_json::json!({"binding_id": binding.binding_id, "scopes": binding.scopes}),
                vec![ReplayMutationEvent::new(
                    "identity.scope_granted",
                    serde_json::json!({
                        "binding_id": binding.binding_id,
                        "scope": scope,
                        "granted_by": record.actor_binding_id,
                    }),
                )],
            ),
            Err(e) => HandlerOutcome::failed(e.code()),
        }
    }
}
