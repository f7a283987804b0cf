use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("request timestamp outside the tolerance window")]
    TimestampStale,

    #[error("adapter is not configured with a secret")]
    NotConfigured,

    #[error("payload invalid: {0}")]
    PayloadInvalid(String),
}

impl AdapterError {
    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::SignatureInvalid(_) | AdapterError::NotConfigured => {
                "adapter_signature_invalid"
            }
            AdapterError::TimestampStale => "adapter_timestamp_stale",
            AdapterError::PayloadInvalid(_) => "adapter_payload_invalid",
        }
    }

    /// HTTP status the gateway answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            AdapterError::SignatureInvalid(_)
            | AdapterError::TimestampStale
            | AdapterError::NotConfigured => 401,
            AdapterError::PayloadInvalid(_) => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
