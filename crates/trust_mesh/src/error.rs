//! Trust registry error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a trust registry.
///
/// Verification never produces these; an unknown or unusable key is a
/// normal "untrusted" outcome.
#[derive(Debug, Error)]
pub enum TrustLoadError {
    /// Registry file missing or unreadable
    #[error("Cannot read trust registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Registry is not valid JSON or does not match the document shape
    #[error("Malformed trust registry: {0}")]
    Parse(#[from] serde_json::Error),

    /// A single entry carries unusable key material
    #[error("Invalid trust entry {ingester_id}/{key_version}: {reason}")]
    InvalidEntry {
        ingester_id: String,
        key_version: String,
        reason: String,
    },
}

/// Result type for trust registry operations.
pub type TrustResult<T> = Result<T, TrustLoadError>;
