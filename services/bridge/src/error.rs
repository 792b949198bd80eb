//! Bridge error types.
//!
//! Only startup and shutdown failures surface here. Per-reading problems are
//! counted by the acceptance policy and never become errors.

use std::path::PathBuf;
use thiserror::Error;

use meshward_mesh::MeshError;
use meshward_stream::{SinkError, WriterError};
use meshward_trust_mesh::TrustLoadError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration file missing or unreadable
    #[error("Cannot read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML
    #[error("Malformed config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration value out of range
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Trust registry could not be loaded at startup
    #[error("Trust registry error: {0}")]
    Trust(#[from] TrustLoadError),

    /// Persistence sink could not be opened
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Lifecycle call made in the wrong state
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: &'static str, to: &'static str },
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
