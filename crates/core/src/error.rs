//! Core error types

use thiserror::Error;

/// Errors raised while decoding or normalizing readings.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload is not a well-formed reading message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Signature field is not valid hex
    #[error("Invalid signature encoding: {0}")]
    SignatureEncoding(#[from] hex::FromHexError),

    /// JSON decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
