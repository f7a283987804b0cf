//! The interaction presenter: every pipeline outcome renders into a compact
//! ACK (returned inline to the transport) and a detailed body (queued into
//! the outbox for asynchronous delivery).

use crate::types::EnvelopeKind;
use mu_core::CommandState;

/// Rendered pair for one pipeline outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionMessage {
    /// `<INTENT> · <STATE>` plus an optional reason line.
    pub compact: String,
    /// Full body for the deferred outbox delivery.
    pub detailed: String,
}

/// Render an outcome. `intent` is the command key (or raw text fallback),
/// `state` the outcome word shown to the operator.
pub fn present(
    intent: &str,
    state: &str,
    reason: Option<&str>,
    detail: Option<&str>,
) -> InteractionMessage {
    let intent_upper = intent.to_uppercase();
    let compact = match reason {
        Some(reason) => format!("{intent_upper} · {state}\nreason: {reason}"),
        None => format!("{intent_upper} · {state}"),
    };

    let mut detailed = compact.clone();
    if let Some(detail) = detail {
        if !detail.is_empty() {
            detailed.push('\n');
            detailed.push_str(detail);
        }
    }
    InteractionMessage { compact, detailed }
}

/// Render a confirmation prompt for an awaiting command.
pub fn present_confirmation_request(
    intent: &str,
    command_id: &str,
    expires_at_ms: i64,
) -> InteractionMessage {
    let msg = present(
        intent,
        "awaiting_confirmation",
        None,
        Some(&format!(
            "reply `confirm {command_id}` to run it or `cancel {command_id}` to drop it (expires at {expires_at_ms})"
        )),
    );
    InteractionMessage {
        compact: format!("{}\nconfirm {}", msg.compact, command_id),
        detailed: msg.detailed,
    }
}

/// Envelope kind for a terminal command state.
pub fn kind_for_state(state: CommandState) -> EnvelopeKind {
    match state {
        CommandState::Completed => EnvelopeKind::Result,
        CommandState::Failed | CommandState::DeadLetter => EnvelopeKind::Error,
        _ => EnvelopeKind::Lifecycle,
    }
}
