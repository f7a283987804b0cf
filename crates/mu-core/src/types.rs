use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a journaled command (UUIDv7 — time-sortable so the
/// journal reads chronologically when grepped by id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(format!("cmd-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one outbox record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxId(pub String);

impl OutboxId {
    pub fn new() -> Self {
        Self(format!("obx-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OutboxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one run-supervisor job (one subprocess launch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(format!("job-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The chat surface a request arrived on. Fixed sum type — adapter dispatch
/// and per-channel safety toggles key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Slack,
    Discord,
    Telegram,
    Neovim,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Slack,
        Channel::Discord,
        Channel::Telegram,
        Channel::Neovim,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Slack => "slack",
            Channel::Discord => "discord",
            Channel::Telegram => "telegram",
            Channel::Neovim => "neovim",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "slack" => Ok(Channel::Slack),
            "discord" => Ok(Channel::Discord),
            "telegram" => Ok(Channel::Telegram),
            "neovim" => Ok(Channel::Neovim),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Trust rank of an identity binding: A > B > C.
///
/// Tier A bindings were verified interactively (link code on the same
/// device); tier C is the floor for anything that merely presented a valid
/// adapter signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuranceTier {
    TierA,
    TierB,
    TierC,
}

impl AssuranceTier {
    /// Numeric rank for comparisons: A=3, B=2, C=1.
    pub fn rank(&self) -> u8 {
        match self {
            AssuranceTier::TierA => 3,
            AssuranceTier::TierB => 2,
            AssuranceTier::TierC => 1,
        }
    }

    pub fn satisfies(&self, required: AssuranceTier) -> bool {
        self.rank() >= required.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssuranceTier::TierA => "tier_a",
            AssuranceTier::TierB => "tier_b",
            AssuranceTier::TierC => "tier_c",
        }
    }
}

impl fmt::Display for AssuranceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AssuranceTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tier_a" => Ok(AssuranceTier::TierA),
            "tier_b" => Ok(AssuranceTier::TierB),
            "tier_c" => Ok(AssuranceTier::TierC),
            other => Err(format!("unknown assurance tier: {other}")),
        }
    }
}

/// Correlation block copied verbatim onto journal entries, outbox envelopes,
/// and run events so an operator can stitch a command's whole story together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_invocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_command_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_root_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ranks_order_a_over_c() {
        assert!(AssuranceTier::TierA.satisfies(AssuranceTier::TierC));
        assert!(AssuranceTier::TierB.satisfies(AssuranceTier::TierB));
        assert!(!AssuranceTier::TierC.satisfies(AssuranceTier::TierB));
    }

    #[test]
    fn channel_round_trips_through_serde() {
        let json = serde_json::to_string(&Channel::Telegram).unwrap();
        assert_eq!(json, "\"telegram\"");
        let back: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Channel::Telegram);
    }

    #[test]
    fn tier_serialises_snake_case() {
        let json = serde_json::to_string(&AssuranceTier::TierA).unwrap();
        assert_eq!(json, "\"tier_a\"");
    }
}
