use std::collections::HashMap;
use tracing::{debug, info};

use mu_core::config::OverflowBehavior;
use mu_core::surface::CommandMode;
use mu_core::Channel;
use mu_identity::IdentityBinding;

use crate::rules::{KillSwitchTarget, PolicyRule, PolicySet, RateLimitPolicy};

/// Outcome of scope/tier authorization. Callers pattern-match; denial
/// reasons are the stable snake_case codes surfaced to operators.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationDecision {
    Allow {
        rule: PolicyRule,
        /// First required scope, recorded as `scope_effective`.
        effective_scope: String,
    },
    Deny {
        reason: &'static str,
        detail: String,
    },
}

/// Outcome of the mutation safety gate.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyDecision {
    Allow,
    /// Window full, overflow policy says try again later.
    Defer { retry_at_ms: i64 },
    Deny {
        reason: &'static str,
        detail: String,
    },
}

/// The reloadable policy engine. Counters are in-memory and owned by the
/// serialized lane; `set_policy` replaces the rule set and resets both
/// counter maps in the same call.
pub struct PolicyEngine {
    set: PolicySet,
    /// (binding_id, window_start) → mutation count.
    actor_windows: HashMap<(String, i64), u32>,
    /// (channel, window_start) → mutation count.
    channel_windows: HashMap<(String, i64), u32>,
}

impl PolicyEngine {
    pub fn new(set: PolicySet) -> Self {
        Self {
            set,
            actor_windows: HashMap::new(),
            channel_windows: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &PolicySet {
        &self.set
    }

    pub fn rule(&self, command_key: &str) -> Option<&PolicyRule> {
        self.set.rule(command_key)
    }

    /// Scope + tier + mode authorization for one command.
    pub fn authorize_command(
        &self,
        command_key: &str,
        binding: &IdentityBinding,
        requested_mode: CommandMode,
    ) -> AuthorizationDecision {
        let rule = match self.set.rule(command_key) {
            Some(rule) => rule,
            None => {
                return AuthorizationDecision::Deny {
                    reason: "unmapped_command",
                    detail: format!("no rule for command {command_key}"),
                }
            }
        };

        match requested_mode {
            CommandMode::Readonly if rule.mutating => {
                return AuthorizationDecision::Deny {
                    reason: "readonly_mode_disallows_mutation",
                    detail: format!("{command_key} mutates but mu? was used"),
                }
            }
            CommandMode::Mutation if !rule.mutating => {
                return AuthorizationDecision::Deny {
                    reason: "mutation_mode_requires_mutating_command",
                    detail: format!("{command_key} is readonly but mu! was used"),
                }
            }
            _ => {}
        }

        if let Some(missing) = rule.scopes.iter().find(|s| !binding.has_scope(s)) {
            return AuthorizationDecision::Deny {
                reason: "missing_scope",
                detail: format!("binding lacks scope {missing}"),
            };
        }

        if !binding.assurance_tier.satisfies(rule.min_assurance_tier) {
            return AuthorizationDecision::Deny {
                reason: "assurance_tier_too_low",
                detail: format!(
                    "requires {} but binding is {}",
                    rule.min_assurance_tier, binding.assurance_tier
                ),
            };
        }

        AuthorizationDecision::Allow {
            rule: rule.clone(),
            effective_scope: rule.scopes[0].clone(),
        }
    }

    /// Kill switches then fixed-window rate counters, in that order. On
    /// allow, both counters are incremented.
    pub fn evaluate_mutation_safety(
        &mut self,
        channel: Channel,
        actor_binding_id: &str,
        ops_class: &str,
        now_ms: i64,
    ) -> SafetyDecision {
        let gates = &self.set.gates;
        if gates.global_disabled {
            return SafetyDecision::Deny {
                reason: "mutations_disabled_global",
                detail: "global mutation kill-switch is on".to_string(),
            };
        }
        if gates.disabled_channels.contains(channel.as_str()) {
            return SafetyDecision::Deny {
                reason: "mutations_disabled_channel",
                detail: format!("mutations disabled for channel {channel}"),
            };
        }
        if gates.disabled_classes.contains(ops_class) {
            return SafetyDecision::Deny {
                reason: "mutations_disabled_class",
                detail: format!("mutations disabled for class {ops_class}"),
            };
        }

        let limits = self.set.rate_limit.clone();
        let window_start = now_ms - now_ms.rem_euclid(limits.window_ms.max(1));
        self.prune_windows(window_start);

        let actor_key = (actor_binding_id.to_string(), window_start);
        let channel_key = (channel.as_str().to_string(), window_start);
        let actor_count = self.actor_windows.get(&actor_key).copied().unwrap_or(0);
        let channel_count = self.channel_windows.get(&channel_key).copied().unwrap_or(0);

        if actor_count >= limits.actor_limit || channel_count >= limits.channel_limit {
            return match limits.overflow_behavior {
                OverflowBehavior::Defer => SafetyDecision::Defer {
                    retry_at_ms: now_ms + limits.defer_ms,
                },
                OverflowBehavior::Fail => SafetyDecision::Deny {
                    reason: "backpressure_overflow",
                    detail: format!(
                        "window full (actor {actor_count}/{}, channel {channel_count}/{})",
                        limits.actor_limit, limits.channel_limit
                    ),
                },
            };
        }

        *self.actor_windows.entry(actor_key).or_insert(0) += 1;
        *self.channel_windows.entry(channel_key).or_insert(0) += 1;
        SafetyDecision::Allow
    }

    /// Replace the active policy and reset rate counters atomically (one
    /// &mut section — no observer can see new rules with old counters).
    pub fn set_policy(&mut self, next: PolicySet) {
        info!(rules = next.rules.len(), "policy replaced; rate counters reset");
        self.set = next;
        self.actor_windows.clear();
        self.channel_windows.clear();
    }

    /// Flip one kill switch in place.
    pub fn set_kill_switch(&mut self, target: KillSwitchTarget, disabled: bool) {
        match target {
            KillSwitchTarget::Global => self.set.gates.global_disabled = disabled,
            KillSwitchTarget::Channel { channel } => {
                if disabled {
                    self.set.gates.disabled_channels.insert(channel);
                } else {
                    self.set.gates.disabled_channels.remove(&channel);
                }
            }
            KillSwitchTarget::Class { ops_class } => {
                if disabled {
                    self.set.gates.disabled_classes.insert(ops_class);
                } else {
                    self.set.gates.disabled_classes.remove(&ops_class);
                }
            }
        }
    }

    /// Override the window limits without touching rules. Counters reset so
    /// the new limits take effect from a clean window.
    pub fn override_rate_limit(&mut self, rate_limit: RateLimitPolicy) {
        debug!(
            window_ms = rate_limit.window_ms,
            actor_limit = rate_limit.actor_limit,
            "rate limit overridden"
        );
        self.set.rate_limit = rate_limit;
        self.actor_windows.clear();
        self.channel_windows.clear();
    }

    fn prune_windows(&mut self, current_window_start: i64) {
        self.actor_windows
            .retain(|(_, start), _| *start >= current_window_start);
        self.channel_windows
            .retain(|(_, start), _| *start >= current_window_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::config::SafetyConfig;
    use mu_core::AssuranceTier;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicySet::from_config(&SafetyConfig::default()))
    }

    fn binding(scopes: &[&str], tier: AssuranceTier) -> IdentityBinding {
        IdentityBinding {
            binding_id: "bind-1".into(),
            channel: Channel::Slack,
            channel_tenant_id: "T1".into(),
            actor_id: "U1".into(),
            display_name: "Operator".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            assurance_tier: tier,
            linked_at_ms: 0,
            revoked: false,
        }
    }

    #[test]
    fn unmapped_command_is_denied() {
        let engine = engine();
        let b = binding(&["cp.read"], AssuranceTier::TierA);
        match engine.authorize_command("dance", &b, CommandMode::Auto) {
            AuthorizationDecision::Deny { reason, .. } => assert_eq!(reason, "unmapped_command"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn missing_scope_and_low_tier_denials() {
        let engine = engine();
        let no_scope = binding(&["cp.read"], AssuranceTier::TierA);
        match engine.authorize_command("issue close", &no_scope, CommandMode::Auto) {
            AuthorizationDecision::Deny { reason, .. } => assert_eq!(reason, "missing_scope"),
            other => panic!("{other:?}"),
        }

        let low_tier = binding(&["cp.read", "cp.issue.write"], AssuranceTier::TierC);
        match engine.authorize_command("issue close", &low_tier, CommandMode::Auto) {
            AuthorizationDecision::Deny { reason, .. } => {
                assert_eq!(reason, "assurance_tier_too_low")
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn mode_contradictions_are_denied() {
        let engine = engine();
        let b = binding(&["cp.read", "cp.issue.write"], AssuranceTier::TierA);
        match engine.authorize_command("issue close", &b, CommandMode::Readonly) {
            AuthorizationDecision::Deny { reason, .. } => {
                assert_eq!(reason, "readonly_mode_disallows_mutation")
            }
            other => panic!("{other:?}"),
        }
        match engine.authorize_command("status", &b, CommandMode::Mutation) {
            AuthorizationDecision::Deny { reason, .. } => {
                assert_eq!(reason, "mutation_mode_requires_mutating_command")
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn allow_returns_first_scope_as_effective() {
        let engine = engine();
        let b = binding(&["cp.read", "cp.issue.write"], AssuranceTier::TierA);
        match engine.authorize_command("issue close", &b, CommandMode::Auto) {
            AuthorizationDecision::Allow { effective_scope, rule } => {
                assert_eq!(effective_scope, "cp.issue.write");
                assert!(rule.confirmation_required);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn actor_window_defers_on_overflow() {
        let mut cfg = SafetyConfig::default();
        cfg.window_ms = 60_000;
        cfg.actor_limit = 2;
        cfg.defer_ms = 5_000;
        let mut engine = PolicyEngine::new(PolicySet::from_config(&cfg));

        for _ in 0..2 {
            assert_eq!(
                engine.evaluate_mutation_safety(Channel::Slack, "bind-1", "issue", 0),
                SafetyDecision::Allow
            );
        }
        assert_eq!(
            engine.evaluate_mutation_safety(Channel::Slack, "bind-1", "issue", 0),
            SafetyDecision::Defer { retry_at_ms: 5_000 }
        );
        // A different binding still has budget, channel limit permitting.
        assert_eq!(
            engine.evaluate_mutation_safety(Channel::Slack, "bind-2", "issue", 0),
            SafetyDecision::Allow
        );
    }

    #[test]
    fn overflow_fail_mode_denies() {
        let mut cfg = SafetyConfig::default();
        cfg.actor_limit = 1;
        cfg.overflow_behavior = OverflowBehavior::Fail;
        let mut engine = PolicyEngine::new(PolicySet::from_config(&cfg));
        engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 0);
        match engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 0) {
            SafetyDecision::Deny { reason, .. } => assert_eq!(reason, "backpressure_overflow"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn window_rolls_over() {
        let mut cfg = SafetyConfig::default();
        cfg.window_ms = 1_000;
        cfg.actor_limit = 1;
        let mut engine = PolicyEngine::new(PolicySet::from_config(&cfg));
        assert_eq!(
            engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 100),
            SafetyDecision::Allow
        );
        assert!(matches!(
            engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 900),
            SafetyDecision::Defer { .. }
        ));
        // Next window — fresh budget.
        assert_eq!(
            engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 1_000),
            SafetyDecision::Allow
        );
    }

    #[test]
    fn kill_switch_precedence_global_channel_class() {
        let mut engine = engine();
        engine.set_kill_switch(KillSwitchTarget::Global, true);
        match engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 0) {
            SafetyDecision::Deny { reason, .. } => assert_eq!(reason, "mutations_disabled_global"),
            other => panic!("{other:?}"),
        }
        engine.set_kill_switch(KillSwitchTarget::Global, false);
        engine.set_kill_switch(
            KillSwitchTarget::Channel {
                channel: "slack".into(),
            },
            true,
        );
        match engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 0) {
            SafetyDecision::Deny { reason, .. } => assert_eq!(reason, "mutations_disabled_channel"),
            other => panic!("{other:?}"),
        }
        assert_eq!(
            engine.evaluate_mutation_safety(Channel::Discord, "b", "issue", 0),
            SafetyDecision::Allow
        );
        engine.set_kill_switch(
            KillSwitchTarget::Class {
                ops_class: "issue".into(),
            },
            true,
        );
        match engine.evaluate_mutation_safety(Channel::Discord, "b", "issue", 0) {
            SafetyDecision::Deny { reason, .. } => assert_eq!(reason, "mutations_disabled_class"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn set_policy_resets_counters() {
        let mut cfg = SafetyConfig::default();
        cfg.actor_limit = 1;
        let mut engine = PolicyEngine::new(PolicySet::from_config(&cfg));
        engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 0);
        assert!(matches!(
            engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 1),
            SafetyDecision::Defer { .. }
        ));
        engine.set_policy(PolicySet::from_config(&cfg));
        assert_eq!(
            engine.evaluate_mutation_safety(Channel::Slack, "b", "issue", 2),
            SafetyDecision::Allow
        );
    }
}
