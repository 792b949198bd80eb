//! Verified subscription delivery.
//!
//! `MeshSubscriber` owns one subscription. A dedicated worker task drains the
//! transport channel, decodes each sample, checks any originator signature
//! against the trust store and hands accepted readings to a
//! [`ReadingHandler`]. A slow handler fills the bounded channel; the
//! transport session keeps running.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use meshward_core::{DecodedMessage, Reading, SignedEnvelope};
use meshward_trust_mesh::TrustStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::key_expr::KeyExpr;
use crate::transport::{MeshSample, MeshTransport};

/// Receives every reading that passed decoding and signature checks.
///
/// `envelope` is `None` for unsigned traffic.
#[async_trait]
pub trait ReadingHandler: Send + Sync {
    async fn on_reading(&self, reading: Reading, envelope: Option<SignedEnvelope>);

    /// Checked for signed samples before their signature is verified.
    /// Returning true drops the sample unverified and undelivered, so it
    /// must not record anything.
    fn already_seen(&self, _reading: &Reading) -> bool {
        false
    }
}

/// Subscriber counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Samples delivered to the handler (signed and verified, or unsigned)
    pub verified: u64,
    /// Signed samples whose signature did not verify
    pub rejected: u64,
    /// Samples that could not be decoded
    pub malformed: u64,
    /// Signed samples skipped before verification as already seen
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    verified: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SubscriberStats {
        SubscriberStats {
            verified: self.verified.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct MeshSubscriber {
    transport: Arc<dyn MeshTransport>,
    trust: Arc<TrustStore>,
    handler: Arc<dyn ReadingHandler>,
    counters: Arc<Counters>,
    key_expr: Mutex<Option<KeyExpr>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MeshSubscriber {
    pub fn new(
        transport: Arc<dyn MeshTransport>,
        trust: Arc<TrustStore>,
        handler: Arc<dyn ReadingHandler>,
    ) -> Self {
        Self {
            transport,
            trust,
            handler,
            counters: Arc::new(Counters::default()),
            key_expr: Mutex::new(None),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        self.transport.connect().await
    }

    /// Subscribe and start the delivery worker.
    pub async fn subscribe(&self, key_expr: &KeyExpr) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        if let Some(existing) = lock(&self.key_expr).as_ref() {
            return Err(MeshError::AlreadySubscribed(existing.to_string()));
        }

        let rx = self.transport.subscribe(key_expr).await?;
        *lock(&self.key_expr) = Some(key_expr.clone());

        let worker = tokio::spawn(deliver(
            rx,
            Arc::clone(&self.trust),
            Arc::clone(&self.handler),
            Arc::clone(&self.counters),
        ));
        *lock(&self.worker) = Some(worker);

        info!(key_expr = %key_expr, "subscribed");
        Ok(())
    }

    /// Close the transport and wait for already-received samples to be
    /// delivered. Later calls are no-ops.
    pub async fn close(&self) -> MeshResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.transport.close().await;

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "subscriber worker ended abnormally");
            }
        }

        let stats = self.stats();
        info!(
            verified = stats.verified,
            rejected = stats.rejected,
            malformed = stats.malformed,
            skipped = stats.skipped,
            "subscriber closed"
        );
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SubscriberStats {
        self.counters.snapshot()
    }
}

impl Drop for MeshSubscriber {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn deliver(
    mut rx: mpsc::Receiver<MeshSample>,
    trust: Arc<TrustStore>,
    handler: Arc<dyn ReadingHandler>,
    counters: Arc<Counters>,
) {
    while let Some(sample) = rx.recv().await {
        if let Some((reading, envelope)) = screen(&sample, &trust, handler.as_ref(), &counters) {
            handler.on_reading(reading, envelope).await;
        }
    }
    debug!("subscription stream ended");
}

/// Decode and verify one sample, updating counters.
fn screen(
    sample: &MeshSample,
    trust: &TrustStore,
    handler: &dyn ReadingHandler,
    counters: &Counters,
) -> Option<(Reading, Option<SignedEnvelope>)> {
    let decoded = match DecodedMessage::decode(&sample.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(key = %sample.key, error = %e, "dropping malformed sample");
            return None;
        }
    };

    if let Some(envelope) = &decoded.envelope {
        if handler.already_seen(&decoded.reading) {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %sample.key,
                device_id = decoded.reading.device_id(),
                "skipping already-seen sample"
            );
            return None;
        }

        let trusted = trust.verify(
            &envelope.ingester_id,
            envelope.key_version,
            &decoded.canonical,
            &envelope.signature,
        );
        if !trusted {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %sample.key,
                ingester_id = %envelope.ingester_id,
                key_version = envelope.key_version,
                device_id = decoded.reading.device_id(),
                "signature rejected"
            );
            return None;
        }
    }

    counters.verified.fetch_add(1, Ordering::Relaxed);
    Some((decoded.reading, decoded.envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalMesh;
    use ed25519_dalek::{Signer, SigningKey};
    use meshward_core::{canonical_bytes, encode_message};
    use meshward_trust_mesh::{KeyStatus, TrustEntry, TrustRegistry};
    use rand::RngCore;
    use serde_json::json;
    use tokio::sync::Mutex as AsyncMutex;

    const KEY: &str = "telemetry/v2/live/nz/dev-1";

    #[derive(Default)]
    struct Collector {
        seen: AsyncMutex<Vec<(Reading, Option<SignedEnvelope>)>>,
    }

    #[async_trait]
    impl ReadingHandler for Collector {
        async fn on_reading(&self, reading: Reading, envelope: Option<SignedEnvelope>) {
            self.seen.lock().await.push((reading, envelope));
        }
    }

    fn generate_key() -> SigningKey {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        SigningKey::from_bytes(&secret)
    }

    fn trust_with(key: &SigningKey, status: KeyStatus) -> Arc<TrustStore> {
        let store = TrustStore::new("unused.json");
        let mut registry = TrustRegistry::new();
        registry.insert(TrustEntry {
            ingester_id: "wsi_1".into(),
            key_version: 2,
            key: key.verifying_key(),
            status,
            expires_at: None,
        });
        store.install(registry);
        Arc::new(store)
    }

    fn signed_payload(key: &SigningKey, reading: &serde_json::Value) -> Vec<u8> {
        let canonical = canonical_bytes(reading).unwrap();
        let envelope = SignedEnvelope {
            signature: key.sign(&canonical).to_bytes().to_vec(),
            ingester_id: "wsi_1".into(),
            key_version: 2,
        };
        encode_message(reading, Some(&envelope)).unwrap()
    }

    async fn running(
        trust: Arc<TrustStore>,
    ) -> (LocalMesh, MeshSubscriber, Arc<Collector>) {
        let mesh = LocalMesh::new();
        let collector = Arc::new(Collector::default());
        let subscriber = MeshSubscriber::new(
            Arc::new(mesh.clone()),
            trust,
            collector.clone(),
        );
        subscriber.connect().await.unwrap();
        subscriber
            .subscribe(&KeyExpr::new("telemetry/v2/live/**").unwrap())
            .await
            .unwrap();
        (mesh, subscriber, collector)
    }

    #[tokio::test]
    async fn test_verified_signed_reading_is_delivered() {
        let key = generate_key();
        let (mesh, subscriber, collector) = running(trust_with(&key, KeyStatus::Active)).await;

        let reading = json!({"device_id": "dev-1", "timestamp": 1000, "value": 21.5});
        mesh.publish(KEY, signed_payload(&key, &reading)).await;
        subscriber.close().await.unwrap();

        let seen = collector.seen.lock().await;
        assert_eq!(seen.len(), 1);
        let envelope = seen[0].1.as_ref().unwrap();
        assert_eq!(envelope.ingester_id, "wsi_1");
        assert_eq!(envelope.key_version, 2);
        assert_eq!(subscriber.stats().verified, 1);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_callback() {
        let key = generate_key();
        let other = generate_key();
        let (mesh, subscriber, collector) = running(trust_with(&key, KeyStatus::Active)).await;

        let reading = json!({"device_id": "dev-1", "timestamp": 1000, "value": 1});
        mesh.publish(KEY, signed_payload(&other, &reading)).await;
        subscriber.close().await.unwrap();

        assert!(collector.seen.lock().await.is_empty());
        assert_eq!(
            subscriber.stats(),
            SubscriberStats {
                verified: 0,
                rejected: 1,
                malformed: 0,
                skipped: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_tampered_reading_is_rejected() {
        let key = generate_key();
        let (mesh, subscriber, collector) = running(trust_with(&key, KeyStatus::Active)).await;

        let reading = json!({"device_id": "dev-1", "timestamp": 1000, "value": 1});
        let payload = signed_payload(&key, &reading);
        let tampered = String::from_utf8(payload).unwrap().replace("\"value\":1", "\"value\":2");
        mesh.publish(KEY, tampered.into_bytes()).await;
        subscriber.close().await.unwrap();

        assert!(collector.seen.lock().await.is_empty());
        assert_eq!(subscriber.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_revoked_key_is_rejected() {
        let key = generate_key();
        let (mesh, subscriber, collector) = running(trust_with(&key, KeyStatus::Revoked)).await;

        let reading = json!({"device_id": "dev-1", "timestamp": 1000, "value": 1});
        mesh.publish(KEY, signed_payload(&key, &reading)).await;
        subscriber.close().await.unwrap();

        assert!(collector.seen.lock().await.is_empty());
        assert_eq!(subscriber.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_unsigned_reading_passes_through() {
        let key = generate_key();
        let (mesh, subscriber, collector) = running(trust_with(&key, KeyStatus::Active)).await;

        mesh.publish(KEY, br#"{"device_id":"dev-2","timestamp":1000,"value":3}"#.to_vec())
            .await;
        subscriber.close().await.unwrap();

        let seen = collector.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.device_id(), "dev-2");
        assert!(seen[0].1.is_none());
    }

    /// Treats every device listed in `known` as already seen.
    struct KnownDevices {
        known: Vec<&'static str>,
        inner: Collector,
    }

    #[async_trait]
    impl ReadingHandler for KnownDevices {
        async fn on_reading(&self, reading: Reading, envelope: Option<SignedEnvelope>) {
            self.inner.on_reading(reading, envelope).await;
        }

        fn already_seen(&self, reading: &Reading) -> bool {
            self.known.iter().any(|d| *d == reading.device_id())
        }
    }

    #[tokio::test]
    async fn test_already_seen_signed_sample_skips_verification() {
        let key = generate_key();
        let forger = generate_key();
        let mesh = LocalMesh::new();
        let handler = Arc::new(KnownDevices {
            known: vec!["dev-1"],
            inner: Collector::default(),
        });
        let subscriber = MeshSubscriber::new(
            Arc::new(mesh.clone()),
            trust_with(&key, KeyStatus::Active),
            handler.clone(),
        );
        subscriber.connect().await.unwrap();
        subscriber
            .subscribe(&KeyExpr::new("telemetry/v2/live/**").unwrap())
            .await
            .unwrap();

        let seen = json!({"device_id": "dev-1", "timestamp": 1000, "value": 1});
        let fresh = json!({"device_id": "dev-2", "timestamp": 1000, "value": 1});
        mesh.publish(KEY, signed_payload(&key, &seen)).await;
        mesh.publish(KEY, signed_payload(&forger, &seen)).await;
        mesh.publish(KEY, signed_payload(&forger, &fresh)).await;
        mesh.publish(KEY, signed_payload(&key, &fresh)).await;
        subscriber.close().await.unwrap();

        let delivered = handler.inner.seen.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0.device_id(), "dev-2");
        assert_eq!(
            subscriber.stats(),
            SubscriberStats {
                verified: 1,
                rejected: 1,
                malformed: 0,
                skipped: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_counted() {
        let (mesh, subscriber, collector) = running(Arc::new(TrustStore::new("unused.json"))).await;

        mesh.publish(KEY, b"not json".to_vec()).await;
        mesh.publish(KEY, br#"{"reading":{"a":1},"signature":"zz","ingester_id":"x","key_version":1}"#.to_vec())
            .await;
        subscriber.close().await.unwrap();

        assert!(collector.seen.lock().await.is_empty());
        assert_eq!(subscriber.stats().malformed, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mesh, subscriber, _collector) = running(Arc::new(TrustStore::new("unused.json"))).await;

        subscriber.close().await.unwrap();
        subscriber.close().await.unwrap();

        assert!(subscriber.is_closed());
        assert!(mesh.is_closed());
        assert!(matches!(subscriber.connect().await, Err(MeshError::Closed)));
    }

    #[tokio::test]
    async fn test_second_subscribe_is_refused() {
        let (_mesh, subscriber, _collector) = running(Arc::new(TrustStore::new("unused.json"))).await;

        let again = subscriber.subscribe(&KeyExpr::new("other/**").unwrap()).await;
        assert!(matches!(again, Err(MeshError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let mesh = LocalMesh::new();
        mesh.set_unreachable(true);
        let subscriber = MeshSubscriber::new(
            Arc::new(mesh),
            Arc::new(TrustStore::new("unused.json")),
            Arc::new(Collector::default()),
        );
        assert!(matches!(subscriber.connect().await, Err(MeshError::Connect { .. })));
    }
}
