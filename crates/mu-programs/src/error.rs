use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("program not found: {program_id}")]
    NotFound { program_id: String },

    #[error("invalid program: {0}")]
    InvalidProgram(String),
}

impl ProgramError {
    pub fn code(&self) -> &'static str {
        match self {
            ProgramError::InvalidCron(_) => "cron_expr_invalid",
            ProgramError::InvalidTimezone(_) => "cron_tz_invalid",
            ProgramError::NotFound { .. } => "context_missing",
            ProgramError::InvalidProgram(_) => "cli_validation_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProgramError>;
