//! In-process mesh router.
//!
//! `LocalMesh` is cheap to clone; every clone shares the same routing table,
//! so one handle can be given to a subscriber while another publishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::key_expr::KeyExpr;
use crate::transport::{MeshSample, MeshTransport, DEFAULT_CHANNEL_CAPACITY};

#[derive(Clone)]
pub struct LocalMesh {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: usize,
    routes: Mutex<Vec<Route>>,
    connected: AtomicBool,
    closed: AtomicBool,
    unreachable: AtomicBool,
}

struct Route {
    key_expr: KeyExpr,
    tx: mpsc::Sender<MeshSample>,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                routes: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                unreachable: AtomicBool::new(false),
            }),
        }
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.routes().iter().filter(|r| !r.tx.is_closed()).count()
    }

    /// Route a payload to every matching subscription.
    ///
    /// Waits for channel space, so a full subscriber slows the publisher.
    /// Returns the number of subscriptions the sample reached.
    pub async fn publish(&self, key: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let targets: Vec<mpsc::Sender<MeshSample>> = self
            .routes()
            .iter()
            .filter(|r| r.key_expr.matches(key))
            .map(|r| r.tx.clone())
            .collect();

        let mut delivered = 0;
        for tx in targets {
            if tx.send(MeshSample::new(key, payload.clone())).await.is_ok() {
                delivered += 1;
            }
        }

        debug!(key, delivered, "local publish");
        delivered
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Vec<Route>> {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocalMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshTransport for LocalMesh {
    async fn connect(&self) -> MeshResult<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(MeshError::Connect {
                endpoint: "local".into(),
                reason: "mesh marked unreachable".into(),
            });
        }
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, key_expr: &KeyExpr) -> MeshResult<mpsc::Receiver<MeshSample>> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(MeshError::NotConnected);
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut routes = self.routes();
        routes.retain(|r| !r.tx.is_closed());
        routes.push(Route {
            key_expr: key_expr.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) -> MeshResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        // Dropping the senders ends every subscription stream.
        self.routes().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(s: &str) -> KeyExpr {
        KeyExpr::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_publish_routes_by_key_expr() {
        let mesh = LocalMesh::new();
        mesh.connect().await.unwrap();

        let mut live = mesh.subscribe(&expr("telemetry/v2/live/**")).await.unwrap();
        let mut other = mesh.subscribe(&expr("telemetry/v2/archive/*")).await.unwrap();

        assert_eq!(mesh.publish("telemetry/v2/live/nz/dev-1", b"{}".to_vec()).await, 1);

        let sample = live.recv().await.unwrap();
        assert_eq!(sample.key, "telemetry/v2/live/nz/dev-1");
        assert_eq!(sample.payload, b"{}");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_requires_connect() {
        let mesh = LocalMesh::new();
        let result = mesh.subscribe(&expr("a/**")).await;
        assert!(matches!(result, Err(MeshError::NotConnected)));
    }

    #[tokio::test]
    async fn test_unreachable_connect_fails() {
        let mesh = LocalMesh::new();
        mesh.set_unreachable(true);
        assert!(matches!(mesh.connect().await, Err(MeshError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let mesh = LocalMesh::new();
        mesh.connect().await.unwrap();
        let mut rx = mesh.subscribe(&expr("a/**")).await.unwrap();

        mesh.close().await.unwrap();
        mesh.close().await.unwrap();

        assert!(rx.recv().await.is_none());
        assert_eq!(mesh.publish("a/b", b"x".to_vec()).await, 0);
        assert!(matches!(mesh.subscribe(&expr("a/**")).await, Err(MeshError::Closed)));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let mesh = LocalMesh::new();
        mesh.connect().await.unwrap();
        let rx = mesh.subscribe(&expr("a/**")).await.unwrap();
        assert_eq!(mesh.subscription_count(), 1);

        drop(rx);
        assert_eq!(mesh.subscription_count(), 0);
        assert_eq!(mesh.publish("a/b", b"x".to_vec()).await, 0);
    }
}
