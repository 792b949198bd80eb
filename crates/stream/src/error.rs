//! Error types for Meshward stream operations.
//!
//! Covers the durable row sink and the buffered writer in front of it.

use thiserror::Error;

/// Errors raised by a row sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Table name is not a plain identifier
    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    /// Sink was already closed
    #[error("Sink is closed")]
    Closed,

    /// Blocking sink task failed to complete
    #[error("Sink task failed: {0}")]
    Task(String),

    /// Failure injected or reported by a non-database sink
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the buffered writer.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Writer was closed; no more rows are accepted
    #[error("Writer is closed")]
    Closed,

    /// Final close of the underlying sink failed
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Result type for writer operations.
pub type WriterResult<T> = Result<T, WriterError>;
