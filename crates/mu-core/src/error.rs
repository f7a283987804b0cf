use thiserror::Error;

use crate::command::CommandState;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("illegal command transition: {from} -> {to}")]
    InvalidTransition { from: CommandState, to: CommandState },

    #[error("invalid envelope: {0}")]
    Envelope(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Stable snake_case reason code surfaced in ACKs and journal entries.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::Envelope(_) => "adapter_payload_invalid",
            CoreError::Config(_) => "config_invalid",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
