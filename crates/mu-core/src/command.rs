use serde::{Deserialize, Serialize};
use std::fmt;

use crate::envelope::InboundEnvelope;
use crate::error::CoreError;
use crate::types::{AssuranceTier, Channel, CommandId, Correlation};

/// Lifecycle state of a command. Terminal states are sticky — the transition
/// checker rejects every outbound arrow from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Accepted,
    AwaitingConfirmation,
    Queued,
    InProgress,
    Deferred,
    Completed,
    Failed,
    Cancelled,
    Expired,
    DeadLetter,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Completed
                | CommandState::Failed
                | CommandState::Cancelled
                | CommandState::Expired
                | CommandState::DeadLetter
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Accepted => "accepted",
            CommandState::AwaitingConfirmation => "awaiting_confirmation",
            CommandState::Queued => "queued",
            CommandState::InProgress => "in_progress",
            CommandState::Deferred => "deferred",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Cancelled => "cancelled",
            CommandState::Expired => "expired",
            CommandState::DeadLetter => "dead_letter",
        }
    }

    /// Legal destination states.
    pub fn allowed_next(&self) -> &'static [CommandState] {
        use CommandState::*;
        match self {
            Accepted => &[AwaitingConfirmation, Queued, Failed, Cancelled, DeadLetter],
            AwaitingConfirmation => &[Queued, Cancelled, Expired, DeadLetter],
            Queued => &[InProgress, Deferred, Cancelled, DeadLetter],
            InProgress => &[Completed, Failed, Deferred, Cancelled, DeadLetter],
            Deferred => &[Queued, Cancelled, DeadLetter],
            Completed | Failed | Cancelled | Expired | DeadLetter => &[],
        }
    }

    pub fn can_transition_to(&self, next: CommandState) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Knobs for a single transition. Default is the plain arrow; replay and
/// handler outcomes override selectively.
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Replace `attempt` outright instead of the queued→in_progress increment.
    pub attempt_override: Option<u32>,
    pub error_code: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Required when entering `deferred`.
    pub retry_at_ms: Option<i64>,
    /// Required when entering `awaiting_confirmation`.
    pub confirmation_expires_at_ms: Option<i64>,
}

/// The durable command entity. One record per accepted command; every field
/// change flows through [`CommandRecord::transition`] and is journaled by the
/// caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub channel: Channel,
    pub channel_tenant_id: String,
    pub channel_conversation_id: String,
    pub actor_id: String,
    pub actor_binding_id: String,
    pub assurance_tier: AssuranceTier,
    pub repo_root: String,
    pub scope_required: String,
    pub scope_effective: String,
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub idempotency_key: String,
    pub fingerprint: String,
    pub request_id: String,
    pub command_text: String,
    pub command_args: Vec<String>,
    pub state: CommandState,
    pub attempt: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<String>,
    #[serde(default)]
    pub correlation: Correlation,
}

impl CommandRecord {
    /// Build a fresh record in `accepted` from a validated envelope.
    pub fn from_envelope(envelope: &InboundEnvelope, command_args: Vec<String>, now_ms: i64) -> Self {
        Self::with_id(CommandId::new(), envelope, command_args, now_ms)
    }

    /// As [`from_envelope`](Self::from_envelope), with a caller-chosen id —
    /// the pipeline allocates the id first so the idempotency claim and the
    /// record agree on it.
    pub fn with_id(
        command_id: CommandId,
        envelope: &InboundEnvelope,
        command_args: Vec<String>,
        now_ms: i64,
    ) -> Self {
        let correlation = Correlation {
            command_id: Some(command_id.0.clone()),
            ..Correlation::default()
        };
        Self {
            command_id,
            channel: envelope.channel,
            channel_tenant_id: envelope.channel_tenant_id.clone(),
            channel_conversation_id: envelope.channel_conversation_id.clone(),
            actor_id: envelope.actor_id.clone(),
            actor_binding_id: envelope.actor_binding_id.clone(),
            assurance_tier: envelope.assurance_tier,
            repo_root: envelope.repo_root.clone(),
            scope_required: envelope.scope_required.clone(),
            scope_effective: envelope.scope_effective.clone(),
            target_type: envelope.target_type.clone(),
            target_id: envelope.target_id.clone(),
            idempotency_key: envelope.idempotency_key.clone(),
            fingerprint: envelope.fingerprint.clone(),
            request_id: envelope.request_id.clone(),
            command_text: envelope.command_text.clone(),
            command_args,
            state: CommandState::Accepted,
            attempt: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            terminal_at_ms: None,
            confirmation_expires_at_ms: None,
            retry_at_ms: None,
            error_code: None,
            result: None,
            replay_of: None,
            correlation,
        }
    }

    /// Apply one lifecycle transition in place.
    ///
    /// Fails with [`CoreError::InvalidTransition`] on an illegal arrow and
    /// leaves the record untouched; callers journal only after success.
    pub fn transition(
        &mut self,
        next: CommandState,
        now_ms: i64,
        opts: TransitionOptions,
    ) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if self.state == CommandState::Queued && next == CommandState::InProgress {
            self.attempt = match opts.attempt_override {
                Some(a) => a,
                None => self.attempt + 1,
            };
        } else if let Some(a) = opts.attempt_override {
            self.attempt = a;
        }

        self.state = next;
        self.updated_at_ms = now_ms;
        self.terminal_at_ms = if next.is_terminal() { Some(now_ms) } else { None };

        self.retry_at_ms = if next == CommandState::Deferred {
            opts.retry_at_ms
        } else {
            None
        };
        self.confirmation_expires_at_ms = if next == CommandState::AwaitingConfirmation {
            opts.confirmation_expires_at_ms
        } else {
            None
        };

        match next {
            // Success clears any stale error unless the handler set one.
            CommandState::Completed => self.error_code = opts.error_code,
            _ => {
                if opts.error_code.is_some() {
                    self.error_code = opts.error_code;
                }
            }
        }
        if opts.result.is_some() {
            self.result = opts.result;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{fingerprint, ENVELOPE_VERSION};

    fn sample_envelope() -> InboundEnvelope {
        InboundEnvelope {
            v: ENVELOPE_VERSION,
            received_at_ms: 1_000,
            request_id: "req-1".into(),
            delivery_id: "del-1".into(),
            channel: Channel::Slack,
            channel_tenant_id: "T1".into(),
            channel_conversation_id: "C1".into(),
            actor_id: "U1".into(),
            actor_binding_id: "bind-1".into(),
            assurance_tier: AssuranceTier::TierA,
            repo_root: "/repo".into(),
            command_text: "/mu issue close mu-123".into(),
            scope_required: "cp.issue.write".into(),
            scope_effective: "cp.issue.write".into(),
            target_type: "issue close".into(),
            target_id: Some("mu-123".into()),
            idempotency_key: "key-1".into(),
            fingerprint: fingerprint(Channel::Slack, "T1", "C1", "U1", "/mu issue close mu-123"),
            metadata: serde_json::json!({}),
        }
    }

    fn record() -> CommandRecord {
        CommandRecord::from_envelope(&sample_envelope(), vec![], 1_000)
    }

    #[test]
    fn fresh_record_is_accepted_attempt_zero() {
        let rec = record();
        assert_eq!(rec.state, CommandState::Accepted);
        assert_eq!(rec.attempt, 0);
        assert!(rec.terminal_at_ms.is_none());
        assert_eq!(rec.correlation.command_id.as_deref(), Some(rec.command_id.as_str()));
    }

    #[test]
    fn full_happy_path_increments_attempt_once() {
        let mut rec = record();
        rec.transition(
            CommandState::AwaitingConfirmation,
            1_001,
            TransitionOptions {
                confirmation_expires_at_ms: Some(2_000),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rec.confirmation_expires_at_ms, Some(2_000));

        rec.transition(CommandState::Queued, 1_002, TransitionOptions::default())
            .unwrap();
        assert!(rec.confirmation_expires_at_ms.is_none());
        assert_eq!(rec.attempt, 0);

        rec.transition(CommandState::InProgress, 1_003, TransitionOptions::default())
            .unwrap();
        assert_eq!(rec.attempt, 1);

        rec.transition(
            CommandState::Completed,
            1_004,
            TransitionOptions {
                result: Some(serde_json::json!({"ok": true})),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rec.terminal_at_ms, Some(1_004));
        assert!(rec.error_code.is_none());
    }

    #[test]
    fn illegal_arrow_rejected_and_record_unchanged() {
        let mut rec = record();
        let before = rec.clone();
        let err = rec
            .transition(CommandState::Completed, 1_001, TransitionOptions::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(rec, before);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut rec = record();
        rec.transition(CommandState::Cancelled, 1_001, TransitionOptions::default())
            .unwrap();
        for next in [
            CommandState::Queued,
            CommandState::Accepted,
            CommandState::Completed,
            CommandState::DeadLetter,
        ] {
            assert!(rec
                .transition(next, 1_002, TransitionOptions::default())
                .is_err());
        }
        assert_eq!(rec.state, CommandState::Cancelled);
        assert_eq!(rec.terminal_at_ms, Some(1_001));
    }

    #[test]
    fn deferred_holds_retry_time_until_requeue() {
        let mut rec = record();
        rec.transition(CommandState::Queued, 1_001, TransitionOptions::default())
            .unwrap();
        rec.transition(
            CommandState::Deferred,
            1_002,
            TransitionOptions {
                retry_at_ms: Some(6_000),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rec.retry_at_ms, Some(6_000));
        rec.transition(CommandState::Queued, 6_001, TransitionOptions::default())
            .unwrap();
        assert!(rec.retry_at_ms.is_none());
    }

    #[test]
    fn attempt_override_wins_on_replay() {
        let mut rec = record();
        rec.transition(CommandState::Queued, 1_001, TransitionOptions::default())
            .unwrap();
        rec.transition(
            CommandState::InProgress,
            1_002,
            TransitionOptions {
                attempt_override: Some(7),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rec.attempt, 7);
    }

    #[test]
    fn record_round_trips_through_json() {
        let rec = record();
        let line = serde_json::to_string(&rec).unwrap();
        let back: CommandRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(rec, back);
    }
}
