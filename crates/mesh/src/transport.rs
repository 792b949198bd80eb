//! Transport seam between the subscriber and a concrete mesh session.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::key_expr::KeyExpr;

/// Default bound for per-subscription delivery channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A raw payload received on a concrete key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSample {
    pub key: String,
    pub payload: Vec<u8>,
}

impl MeshSample {
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// A pub/sub session able to deliver samples matching a key expression.
///
/// Samples arrive on a bounded channel. The channel closes when the
/// transport is closed.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Establish the session. Unreachable peers yield `MeshError::Connect`.
    async fn connect(&self) -> MeshResult<()>;

    /// Start delivering samples whose key matches `key_expr`.
    async fn subscribe(&self, key_expr: &KeyExpr) -> MeshResult<mpsc::Receiver<MeshSample>>;

    /// Tear down the session. Safe to call more than once.
    async fn close(&self) -> MeshResult<()>;
}
