//! Error types for Meshward mesh operations.
//!
//! Per-message problems (bad payloads, untrusted signatures) are counted and
//! dropped by the subscriber; only session-level failures surface here.

use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport unreachable when establishing the session
    #[error("Failed to connect to mesh at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Key expression is empty or malformed
    #[error("Invalid key expression '{0}'")]
    InvalidKeyExpr(String),

    /// Operation requires an established session
    #[error("Not connected")]
    NotConnected,

    /// Subscriber already has an active subscription
    #[error("Already subscribed to '{0}'")]
    AlreadySubscribed(String),

    /// Session was closed
    #[error("Session closed")]
    Closed,

    /// WebSocket protocol errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
