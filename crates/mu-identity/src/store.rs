use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use mu_journal::jsonl;

use crate::error::{IdentityError, Result};
use crate::types::IdentityBinding;

pub const IDENTITIES_FILE: &str = "identities.jsonl";

/// Binding store over `identities.jsonl`. The command journal never owns
/// these rows; link/revoke handlers append here and the journal carries the
/// audit events. Mutations run inside the serialized lane.
pub struct IdentityStore {
    path: PathBuf,
    bindings: HashMap<String, IdentityBinding>,
}

impl IdentityStore {
    pub fn open(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(IDENTITIES_FILE);
        let rows: Vec<IdentityBinding> = jsonl::read_records(&path)?;
        let mut bindings = HashMap::new();
        for row in rows {
            bindings.insert(row.binding_id.clone(), row);
        }
        debug!(bindings = bindings.len(), path = %path.display(), "identity store loaded");
        Ok(Self { path, bindings })
    }

    /// Resolve a binding id to a live (non-revoked) binding.
    pub fn resolve(&self, binding_id: &str) -> Result<&IdentityBinding> {
        match self.bindings.get(binding_id) {
            Some(b) if !b.revoked => Ok(b),
            _ => Err(IdentityError::NotLinked {
                binding_id: binding_id.to_string(),
            }),
        }
    }

    /// Hot-path lookup used by adapters: channel actor → binding.
    pub fn find_by_actor(&self, channel: mu_core::Channel, actor_id: &str) -> Option<&IdentityBinding> {
        self.bindings
            .values()
            .find(|b| !b.revoked && b.channel == channel && b.actor_id == actor_id)
    }

    /// Append a new or updated binding row (latest row per id wins on load).
    pub fn upsert(&mut self, binding: IdentityBinding) -> Result<()> {
        jsonl::append_record(&self.path, &binding)?;
        info!(binding_id = %binding.binding_id, revoked = binding.revoked, "identity binding written");
        self.bindings.insert(binding.binding_id.clone(), binding);
        Ok(())
    }

    /// Mark a binding revoked. Idempotent: revoking a missing or already
    /// revoked binding reports NotLinked so callers surface it.
    pub fn revoke(&mut self, binding_id: &str) -> Result<IdentityBinding> {
        let mut binding = self.resolve(binding_id)?.clone();
        binding.revoked = true;
        self.upsert(binding.clone())?;
        Ok(binding)
    }

    /// Add a scope to a binding, if absent.
    pub fn grant_scope(&mut self, binding_id: &str, scope: &str) -> Result<IdentityBinding> {
        let mut binding = self.resolve(binding_id)?.clone();
        if !binding.has_scope(scope) {
            binding.scopes.push(scope.to_string());
            self.upsert(binding.clone())?;
        }
        Ok(binding)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::{AssuranceTier, Channel};

    fn binding(id: &str, actor: &str) -> IdentityBinding {
        IdentityBinding {
            binding_id: id.to_string(),
            channel: Channel::Slack,
            channel_tenant_id: "T1".into(),
            actor_id: actor.to_string(),
            display_name: "Operator".into(),
            scopes: vec!["cp.read".into()],
            assurance_tier: AssuranceTier::TierB,
            linked_at_ms: 1_000,
            revoked: false,
        }
    }

    #[test]
    fn upsert_resolve_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = IdentityStore::open(dir.path()).unwrap();
            store.upsert(binding("bind-1", "U1")).unwrap();
        }
        let store = IdentityStore::open(dir.path()).unwrap();
        assert_eq!(store.resolve("bind-1").unwrap().actor_id, "U1");
        assert!(store.find_by_actor(Channel::Slack, "U1").is_some());
        assert!(store.find_by_actor(Channel::Discord, "U1").is_none());
    }

    #[test]
    fn revoked_binding_resolves_as_not_linked() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.upsert(binding("bind-1", "U1")).unwrap();
        store.revoke("bind-1").unwrap();

        let err = store.resolve("bind-1").unwrap_err();
        assert_eq!(err.code(), "identity_not_linked");

        // Revocation survives reload — it is just the latest row.
        let store = IdentityStore::open(dir.path()).unwrap();
        assert!(store.resolve("bind-1").is_err());
    }

    #[test]
    fn grant_scope_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        store.upsert(binding("bind-1", "U1")).unwrap();
        store.grant_scope("bind-1", "cp.issue.write").unwrap();
        let b = store.grant_scope("bind-1", "cp.issue.write").unwrap();
        assert_eq!(
            b.scopes.iter().filter(|s| *s == "cp.issue.write").count(),
            1
        );
    }
}
