//! The command surface: every `target_type` the control plane understands,
//! with its core vocabulary (kind, primary scope, ops class, tier floor).
//!
//! The policy engine builds its default rule set from this table; adapters
//! use it to canonicalize `command_text` into `target_type` + args.

use crate::types::AssuranceTier;

/// Execution mode requested by the invocation prefix.
///
/// `/mu` leaves the mode to the rule; `mu?` insists the command is readonly;
/// `mu!` insists it mutates. A mismatch between the insisted mode and the
/// rule's mutating bit is a policy denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Auto,
    Readonly,
    Mutation,
}

/// One entry of the command surface.
#[derive(Debug, Clone, Copy)]
pub struct CommandKeySpec {
    /// Canonical key, e.g. `issue close`. Multi-token keys are matched
    /// longest-first.
    pub key: &'static str,
    pub mutating: bool,
    pub confirmation_required: bool,
    pub primary_scope: &'static str,
    pub ops_class: &'static str,
    pub min_tier: AssuranceTier,
    /// Whether the first argument names the target entity (`target_id`).
    pub addresses_target: bool,
}

/// The full surface, ordered for readability only — lookup goes through
/// [`find_key`].
pub const COMMAND_SURFACE: &[CommandKeySpec] = &[
    // Readonly.
    spec("status", false, false, "cp.read", "read", AssuranceTier::TierC, false),
    spec("ready", false, false, "cp.read", "read", AssuranceTier::TierC, false),
    spec("issue get", false, false, "cp.read", "issue", AssuranceTier::TierC, true),
    spec("issue list", false, false, "cp.read", "issue", AssuranceTier::TierC, false),
    spec("forum read", false, false, "cp.read", "forum", AssuranceTier::TierC, true),
    spec("dlq list", false, false, "cp.read", "admin", AssuranceTier::TierC, false),
    spec("dlq inspect", false, false, "cp.read", "admin", AssuranceTier::TierC, true),
    spec("audit get", false, false, "cp.read", "admin", AssuranceTier::TierC, true),
    // Issue mutations — confirmed two-phase.
    spec("issue create", true, true, "cp.issue.write", "issue", AssuranceTier::TierB, false),
    spec("issue update", true, true, "cp.issue.write", "issue", AssuranceTier::TierB, true),
    spec("issue claim", true, true, "cp.issue.write", "issue", AssuranceTier::TierB, true),
    spec("issue close", true, true, "cp.issue.write", "issue", AssuranceTier::TierB, true),
    spec("issue dep add", true, true, "cp.issue.write", "issue", AssuranceTier::TierB, true),
    spec("issue dep remove", true, true, "cp.issue.write", "issue", AssuranceTier::TierB, true),
    // Forum posts go straight to the queue — low stakes, high frequency.
    spec("forum post", true, false, "cp.forum.write", "forum", AssuranceTier::TierB, false),
    // Runs.
    spec("run start", true, true, "cp.run.write", "run", AssuranceTier::TierB, false),
    spec("run resume", true, true, "cp.run.write", "run", AssuranceTier::TierB, true),
    // Identity lifecycle. `link begin`/`finish` must be reachable before a
    // binding carries any trust, so they sit at tier_c without confirmation.
    spec("link begin", true, false, "cp.read", "identity", AssuranceTier::TierC, false),
    spec("link finish", true, false, "cp.read", "identity", AssuranceTier::TierC, true),
    spec("unlink self", true, false, "cp.read", "identity", AssuranceTier::TierB, false),
    spec("revoke", true, true, "cp.admin", "identity", AssuranceTier::TierB, true),
    spec("grant scope", true, true, "cp.admin", "identity", AssuranceTier::TierA, true),
    // Operator controls. Kill switches skip confirmation on purpose: an
    // operator reaching for one needs it to land now.
    spec("policy update", true, true, "cp.admin", "admin", AssuranceTier::TierA, false),
    spec("kill-switch set", true, false, "cp.admin", "admin", AssuranceTier::TierB, false),
    spec("dlq replay", true, false, "cp.admin", "admin", AssuranceTier::TierB, true),
    spec("rate-limit override", true, false, "cp.admin", "admin", AssuranceTier::TierB, false),
];

const fn spec(
    key: &'static str,
    mutating: bool,
    confirmation_required: bool,
    primary_scope: &'static str,
    ops_class: &'static str,
    min_tier: AssuranceTier,
    addresses_target: bool,
) -> CommandKeySpec {
    CommandKeySpec {
        key,
        mutating,
        confirmation_required,
        primary_scope,
        ops_class,
        min_tier,
        addresses_target,
    }
}

/// Look up a command key by its exact canonical string.
pub fn find_key(key: &str) -> Option<&'static CommandKeySpec> {
    COMMAND_SURFACE.iter().find(|s| s.key == key)
}

/// Result of canonicalizing raw `command_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub mode: CommandMode,
    pub target_type: String,
    pub target_id: Option<String>,
    /// Whitespace-tokenized suffix after the invocation prefix and key tokens.
    pub args: Vec<String>,
}

/// Canonicalize `command_text` against the surface table.
///
/// Strips a leading invocation prefix (`/mu`, `mu!`, `mu?`), then matches the
/// longest known key (three-token before two-token before one-token).
/// Returns `None` when no key matches — the pipeline turns that into an
/// `unmapped_command` denial rather than guessing.
pub fn parse_command_text(text: &str) -> Option<ParsedCommand> {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    let mode = match tokens.first().copied() {
        Some("/mu") | Some("mu") => {
            tokens.remove(0);
            CommandMode::Auto
        }
        Some("mu!") => {
            tokens.remove(0);
            CommandMode::Mutation
        }
        Some("mu?") => {
            tokens.remove(0);
            CommandMode::Readonly
        }
        _ => CommandMode::Auto,
    };

    for take in (1..=3.min(tokens.len())).rev() {
        let candidate = tokens[..take].join(" ");
        if let Some(spec) = find_key(&candidate) {
            let mut args: Vec<String> = tokens[take..].iter().map(|t| t.to_string()).collect();
            let target_id = if spec.addresses_target && !args.is_empty() {
                Some(args.remove(0))
            } else {
                None
            };
            return Some(ParsedCommand {
                mode,
                target_type: spec.key.to_string(),
                target_id,
                args,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_token_key_with_target() {
        let parsed = parse_command_text("/mu issue close mu-123").unwrap();
        assert_eq!(parsed.target_type, "issue close");
        assert_eq!(parsed.target_id.as_deref(), Some("mu-123"));
        assert!(parsed.args.is_empty());
        assert_eq!(parsed.mode, CommandMode::Auto);
    }

    #[test]
    fn parses_three_token_key() {
        let parsed = parse_command_text("mu! issue dep add mu-1 mu-2").unwrap();
        assert_eq!(parsed.target_type, "issue dep add");
        assert_eq!(parsed.target_id.as_deref(), Some("mu-1"));
        assert_eq!(parsed.args, vec!["mu-2".to_string()]);
        assert_eq!(parsed.mode, CommandMode::Mutation);
    }

    #[test]
    fn mode_prefixes_are_recognised() {
        assert_eq!(
            parse_command_text("mu? status").unwrap().mode,
            CommandMode::Readonly
        );
        assert_eq!(
            parse_command_text("mu! forum post hello").unwrap().mode,
            CommandMode::Mutation
        );
    }

    #[test]
    fn unknown_command_is_none() {
        assert!(parse_command_text("/mu dance").is_none());
    }

    #[test]
    fn args_are_suffix_after_key_and_target() {
        let parsed = parse_command_text("/mu issue update mu-9 title New title here").unwrap();
        assert_eq!(parsed.target_id.as_deref(), Some("mu-9"));
        assert_eq!(parsed.args[0], "title");
        assert_eq!(parsed.args.len(), 4);
    }

    #[test]
    fn surface_keys_are_unique() {
        for (i, a) in COMMAND_SURFACE.iter().enumerate() {
            for b in &COMMAND_SURFACE[i + 1..] {
                assert_ne!(a.key, b.key, "duplicate key {}", a.key);
            }
        }
    }

    #[test]
    fn readonly_keys_sit_at_tier_c() {
        for spec in COMMAND_SURFACE.iter().filter(|s| !s.mutating) {
            assert_eq!(spec.min_tier, AssuranceTier::TierC, "{}", spec.key);
            assert_eq!(spec.primary_scope, "cp.read", "{}", spec.key);
        }
    }
}
