use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn run subprocess: {0}")]
    Spawn(String),

    #[error("no run job matching {selector}")]
    NotFound { selector: String },

    #[error("run job {job_id} is not running")]
    NotRunning { job_id: String },
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::Spawn(_) => "run_spawn_failed",
            RunError::NotFound { .. } => "context_missing",
            RunError::NotRunning { .. } => "context_ambiguous",
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;
