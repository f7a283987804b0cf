use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("writer lock at {path} is held by pid {pid} ({owner_id})")]
    WriterLockBusy {
        path: String,
        pid: u32,
        owner_id: String,
    },

    #[error("writer lock not held")]
    WriterLockNotHeld,

    #[error("corrupt record in {path} line {line}: {reason}")]
    CorruptRecord {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JournalError {
    pub fn code(&self) -> &'static str {
        match self {
            JournalError::WriterLockBusy { .. } => "writer_lock_busy",
            JournalError::WriterLockNotHeld => "writer_lock_busy",
            JournalError::CorruptRecord { .. } => "journal_corrupt",
            JournalError::Serialization(_) => "journal_serialization",
            JournalError::Io(_) => "journal_io",
        }
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
