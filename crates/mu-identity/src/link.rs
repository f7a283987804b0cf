//! Two-step linking: `link begin` issues a short-lived code, `link finish
//! <code>` consumes it and produces a binding. Codes are in-memory only —
//! a restart voids them, which is the safe failure mode for a trust
//! bootstrap.

use std::collections::HashMap;
use uuid::Uuid;

use mu_core::{AssuranceTier, Channel};

use crate::error::{IdentityError, Result};
use crate::types::IdentityBinding;

const LINK_CODE_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct PendingLink {
    pub code: String,
    pub channel: Channel,
    pub channel_tenant_id: String,
    pub actor_id: String,
    pub display_name: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Default)]
pub struct LinkCodeRegistry {
    pending: HashMap<String, PendingLink>,
}

impl LinkCodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a code for the requesting actor.
    pub fn begin(
        &mut self,
        channel: Channel,
        channel_tenant_id: &str,
        actor_id: &str,
        display_name: &str,
        now_ms: i64,
    ) -> PendingLink {
        // Short, operator-typable code.
        let code = Uuid::new_v4().simple().to_string()[..8].to_string();
        let pending = PendingLink {
            code: code.clone(),
            channel,
            channel_tenant_id: channel_tenant_id.to_string(),
            actor_id: actor_id.to_string(),
            display_name: display_name.to_string(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms + LINK_CODE_TTL_MS,
        };
        self.pending.insert(code, pending.clone());
        pending
    }

    /// Consume a code, producing a fresh tier_b binding with the baseline
    /// read scope. The caller persists it and journals the event.
    pub fn finish(&mut self, code: &str, now_ms: i64) -> Result<IdentityBinding> {
        let pending = match self.pending.remove(code) {
            Some(p) if now_ms < p.expires_at_ms => p,
            _ => return Err(IdentityError::LinkCodeInvalid),
        };
        Ok(IdentityBinding {
            binding_id: format!("bind-{}", Uuid::now_v7()),
            channel: pending.channel,
            channel_tenant_id: pending.channel_tenant_id,
            actor_id: pending.actor_id,
            display_name: pending.display_name,
            scopes: vec!["cp.read".to_string()],
            assurance_tier: AssuranceTier::TierB,
            linked_at_ms: now_ms,
            revoked: false,
        })
    }

    /// Drop expired codes; called opportunistically from begin/finish paths.
    pub fn prune(&mut self, now_ms: i64) {
        self.pending.retain(|_, p| now_ms < p.expires_at_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_then_finish_builds_binding() {
        let mut reg = LinkCodeRegistry::new();
        let pending = reg.begin(Channel::Telegram, "T1", "actor-9", "Ada", 0);
        let binding = reg.finish(&pending.code, 1_000).unwrap();
        assert_eq!(binding.channel, Channel::Telegram);
        assert_eq!(binding.actor_id, "actor-9");
        assert_eq!(binding.assurance_tier, AssuranceTier::TierB);
        assert!(binding.has_scope("cp.read"));
    }

    #[test]
    fn code_is_single_use() {
        let mut reg = LinkCodeRegistry::new();
        let pending = reg.begin(Channel::Slack, "T1", "U1", "Ada", 0);
        reg.finish(&pending.code, 1).unwrap();
        assert!(reg.finish(&pending.code, 2).is_err());
    }

    #[test]
    fn expired_code_is_rejected() {
        let mut reg = LinkCodeRegistry::new();
        let pending = reg.begin(Channel::Slack, "T1", "U1", "Ada", 0);
        let err = reg.finish(&pending.code, LINK_CODE_TTL_MS + 1).unwrap_err();
        assert_eq!(err.code(), "identity_not_linked");
    }
}
