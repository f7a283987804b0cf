use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no identity binding for {binding_id}")]
    NotLinked { binding_id: String },

    #[error("link code invalid or expired")]
    LinkCodeInvalid,

    #[error("store error: {0}")]
    Store(#[from] mu_journal::JournalError),
}

impl IdentityError {
    pub fn code(&self) -> &'static str {
        match self {
            IdentityError::NotLinked { .. } => "identity_not_linked",
            IdentityError::LinkCodeInvalid => "identity_not_linked",
            IdentityError::Store(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;
