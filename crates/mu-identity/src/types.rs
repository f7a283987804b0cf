use serde::{Deserialize, Serialize};

use mu_core::{AssuranceTier, Channel};

/// One identity binding row: a channel actor linked to the control plane
/// with a scope set and a trust tier.
///
/// Folded by `binding_id` on load — the latest row for an id wins, so
/// revocations and scope grants are plain appends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityBinding {
    pub binding_id: String,
    pub channel: Channel,
    pub channel_tenant_id: String,
    pub actor_id: String,
    pub display_name: String,
    pub scopes: Vec<String>,
    pub assurance_tier: AssuranceTier,
    pub linked_at_ms: i64,
    #[serde(default)]
    pub revoked: bool,
}

impl IdentityBinding {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}
