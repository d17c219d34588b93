use thiserror::Error;

/// Errors returned by protocol-level operations.
#[derive(Debug, Error)]
pub enum PaygateError {
    #[error("signature error: {0}")]
    SignatureError(String),

    #[error("invalid payment context: {0}")]
    InvalidPayment(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
