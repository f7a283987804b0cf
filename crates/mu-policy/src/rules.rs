use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use mu_core::config::{OverflowBehavior, SafetyConfig};
use mu_core::surface::COMMAND_SURFACE;
use mu_core::AssuranceTier;

/// Enforcement rule for one command key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub command_key: String,
    /// Scopes the binding must hold (all of them). Never empty.
    pub scopes: Vec<String>,
    pub mutating: bool,
    pub confirmation_required: bool,
    pub min_assurance_tier: AssuranceTier,
    /// Rate-limit / safety bucket.
    pub ops_class: String,
}

/// Mutation window limits shared by every ops class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_ms: i64,
    pub actor_limit: u32,
    pub channel_limit: u32,
    pub overflow_behavior: OverflowBehavior,
    pub defer_ms: i64,
}

/// Kill switches: global, per-channel, per-class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationGates {
    #[serde(default)]
    pub global_disabled: bool,
    #[serde(default)]
    pub disabled_channels: HashSet<String>,
    #[serde(default)]
    pub disabled_classes: HashSet<String>,
}

/// What a `kill-switch set` command targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum KillSwitchTarget {
    Global,
    Channel { channel: String },
    Class { ops_class: String },
}

/// A complete, swappable policy: rules + limits + gates. `set_policy`
/// replaces the whole thing at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    pub rules: HashMap<String, PolicyRule>,
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub gates: MutationGates,
}

impl PolicySet {
    /// Build the default rule set from the command surface table, with
    /// limits and gates taken from config.
    pub fn from_config(safety: &SafetyConfig) -> Self {
        let mut rules = HashMap::new();
        for spec in COMMAND_SURFACE {
            rules.insert(
                spec.key.to_string(),
                PolicyRule {
                    command_key: spec.key.to_string(),
                    scopes: vec![spec.primary_scope.to_string()],
                    mutating: spec.mutating,
                    confirmation_required: spec.confirmation_required,
                    min_assurance_tier: spec.min_tier,
                    ops_class: spec.ops_class.to_string(),
                },
            );
        }
        Self {
            rules,
            rate_limit: RateLimitPolicy {
                window_ms: safety.window_ms,
                actor_limit: safety.actor_limit,
                channel_limit: safety.channel_limit,
                overflow_behavior: safety.overflow_behavior,
                defer_ms: safety.defer_ms,
            },
            gates: MutationGates {
                global_disabled: !safety.mutations_enabled,
                disabled_channels: safety.disabled_channels.iter().cloned().collect(),
                disabled_classes: safety.disabled_classes.iter().cloned().collect(),
            },
        }
    }

    pub fn rule(&self, command_key: &str) -> Option<&PolicyRule> {
        self.rules.get(command_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_covers_whole_surface() {
        let set = PolicySet::from_config(&SafetyConfig::default());
        assert_eq!(set.rules.len(), COMMAND_SURFACE.len());
        let close = set.rule("issue close").unwrap();
        assert!(close.mutating);
        assert!(close.confirmation_required);
        assert_eq!(close.scopes, vec!["cp.issue.write".to_string()]);
    }

    #[test]
    fn rules_never_have_empty_scopes() {
        let set = PolicySet::from_config(&SafetyConfig::default());
        for rule in set.rules.values() {
            assert!(!rule.scopes.is_empty(), "{}", rule.command_key);
        }
    }

    #[test]
    fn policy_set_round_trips_through_json() {
        let set = PolicySet::from_config(&SafetyConfig::default());
        let json = serde_json::to_string(&set).unwrap();
        let back: PolicySet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
