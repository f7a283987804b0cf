//! Scope authorization, assurance tiers, mutation kill-switches, and
//! fixed-window rate limits. Decisions are plain enums pattern-matched by
//! the pipeline — a denial is an outcome, not an error.

pub mod engine;
pub mod rules;

pub use engine::{AuthorizationDecision, PolicyEngine, SafetyDecision};
pub use rules::{KillSwitchTarget, MutationGates, PolicyRule, PolicySet, RateLimitPolicy};
