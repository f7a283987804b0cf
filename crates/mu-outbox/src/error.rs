use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox record not found: {outbox_id}")]
    NotFound { outbox_id: String },

    #[error("outbox record {outbox_id} is not dead-lettered")]
    NotDeadLetter { outbox_id: String },

    #[error("store error: {0}")]
    Store(#[from] mu_journal::JournalError),
}

impl OutboxError {
    pub fn code(&self) -> &'static str {
        match self {
            OutboxError::NotFound { .. } => "outbox_not_found",
            OutboxError::NotDeadLetter { .. } => "outbox_not_dead_letter",
            OutboxError::Store(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;
