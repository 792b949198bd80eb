//! Bridge lifecycle.
//!
//! `Init -> Connecting -> Running -> Draining -> Stopped`. Startup failures
//! leave nothing running; shutdown closes the subscriber first so every
//! reading already received still reaches the writer's final flush.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use meshward_core::{DedupFingerprint, Reading, SignedEnvelope};
use meshward_mesh::{KeyExpr, MeshSubscriber, MeshTransport, ReadingHandler, WsTransport};
use meshward_stream::{BufferedWriter, DeduplicationCache, RowSink, SqliteSink, WriterError};
use meshward_trust_mesh::TrustStore;
use tokio::sync::OnceCell;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::policy::{accept, Acceptance};
use crate::stats::{BridgeStats, StatsReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Init,
    Connecting,
    Running,
    Draining,
    Stopped,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Init => "init",
            BridgeState::Connecting => "connecting",
            BridgeState::Running => "running",
            BridgeState::Draining => "draining",
            BridgeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery-side handler: acceptance policy, then append.
struct AcceptingHandler {
    dedup: Arc<DeduplicationCache>,
    writer: Arc<BufferedWriter>,
    stats: Arc<BridgeStats>,
}

#[async_trait]
impl ReadingHandler for AcceptingHandler {
    async fn on_reading(&self, reading: Reading, envelope: Option<SignedEnvelope>) {
        let Acceptance::Accept(row) = accept(&reading, envelope.as_ref(), &self.dedup, &self.stats)
        else {
            return;
        };

        match self.writer.append(row).await {
            Ok(()) => self.stats.record_written(),
            Err(WriterError::Closed) => {
                self.stats.record_dropped_after_close();
                debug!(device_id = reading.device_id(), "writer closed, reading not persisted");
            }
            Err(e) => {
                warn!(error = %e, device_id = reading.device_id(), "append failed");
            }
        }
    }

    /// Relayed copies of an already-persisted reading skip signature checks.
    fn already_seen(&self, reading: &Reading) -> bool {
        if !self.dedup.contains(&DedupFingerprint::from_reading(reading)) {
            return false;
        }
        self.stats.record_received();
        self.stats.record_duplicate();
        true
    }
}

pub struct Bridge {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    trust: Arc<TrustStore>,
    dedup: Arc<DeduplicationCache>,
    writer: Arc<BufferedWriter>,
    subscriber: MeshSubscriber,
    stats: Arc<BridgeStats>,
    drained: OnceCell<()>,
}

impl Bridge {
    /// Load the trust registry, open the SQLite sink and start the writer.
    ///
    /// Any failure here is fatal for the process. Must be called from within
    /// a tokio runtime.
    pub fn init(config: BridgeConfig) -> BridgeResult<Self> {
        let trust = Arc::new(TrustStore::new(&config.trust_file));
        let entries = trust.load()?;
        info!(
            path = %config.trust_file.display(),
            entries,
            "trust store loaded"
        );

        let sink = SqliteSink::open(&config.sink.path, &config.sink.table)?;
        let transport =
            WsTransport::with_capacity(config.mesh.endpoint.clone(), config.mesh.channel_capacity);

        Ok(Self::with_parts(
            config,
            trust,
            Arc::new(sink),
            Arc::new(transport),
        ))
    }

    /// Assemble a bridge from pre-built collaborators.
    pub fn with_parts(
        config: BridgeConfig,
        trust: Arc<TrustStore>,
        sink: Arc<dyn RowSink>,
        transport: Arc<dyn MeshTransport>,
    ) -> Self {
        let dedup = Arc::new(DeduplicationCache::new(config.dedup_config()));
        let writer = Arc::new(BufferedWriter::start(sink, config.writer_config()));
        let stats = Arc::new(BridgeStats::new());

        let handler = Arc::new(AcceptingHandler {
            dedup: Arc::clone(&dedup),
            writer: Arc::clone(&writer),
            stats: Arc::clone(&stats),
        });
        let subscriber = MeshSubscriber::new(transport, Arc::clone(&trust), handler);

        Self {
            config,
            state: Mutex::new(BridgeState::Init),
            trust,
            dedup,
            writer,
            subscriber,
            stats,
            drained: OnceCell::new(),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = %*state, to = %next, "bridge state change");
        *state = next;
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            bridge: self.stats.snapshot(),
            subscriber: self.subscriber.stats(),
            writer: self.writer.stats(),
            dedup: self.dedup.stats(),
        }
    }

    /// Connect to the mesh and subscribe to the configured key expression.
    pub async fn start(&self) -> BridgeResult<()> {
        let current = self.state();
        if current != BridgeState::Init {
            return Err(BridgeError::InvalidState {
                from: current.as_str(),
                to: BridgeState::Connecting.as_str(),
            });
        }
        self.set_state(BridgeState::Connecting);

        let key_expr = KeyExpr::new(&self.config.subscribe_key)?;
        info!(key_expr = %key_expr, "meshward bridge starting");

        self.subscriber.connect().await?;
        self.subscriber.subscribe(&key_expr).await?;

        self.set_state(BridgeState::Running);
        info!(key_expr = %key_expr, "bridge running");
        Ok(())
    }

    /// Report stats periodically until `token` is cancelled, then shut down.
    pub async fn run(&self, token: CancellationToken) -> BridgeResult<()> {
        let mut stats_tick = ticker(self.config.stats_interval());
        let mut reload_tick = self.config.trust_reload_interval().map(ticker);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = stats_tick.tick() => {
                    let evicted = self.dedup.sweep();
                    if evicted > 0 {
                        debug!(evicted, "dedup entries expired");
                    }
                    self.report().log();
                }
                _ = maybe_tick(reload_tick.as_mut()) => {
                    self.reload_trust();
                }
            }
        }

        self.shutdown().await
    }

    /// Reload the trust registry, keeping the current one on failure.
    pub fn reload_trust(&self) {
        match self.trust.load() {
            Ok(entries) => info!(
                entries,
                generation = self.trust.generation(),
                "trust store reloaded"
            ),
            Err(e) => warn!(error = %e, "trust reload failed, keeping previous registry"),
        }
    }

    /// Stop intake and drain.
    ///
    /// Only the first call drains. Calls made while it is in progress wait
    /// for it and then return `Ok`; the first caller gets any close error.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let mut result = Ok(());
        let drain = async {
            result = self.drain().await;
        };
        self.drained.get_or_init(|| drain).await;
        result
    }

    async fn drain(&self) -> BridgeResult<()> {
        info!("shutting down");
        self.set_state(BridgeState::Draining);

        let subscriber_result = self.subscriber.close().await;
        if let Err(e) = &subscriber_result {
            error!(error = %e, "subscriber close failed");
        }

        let writer_result = self.writer.close().await;
        if let Err(e) = &writer_result {
            error!(error = %e, "writer close failed");
        }

        self.set_state(BridgeState::Stopped);
        self.report().log();
        info!("shutdown complete");

        subscriber_result?;
        writer_result?;
        Ok(())
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn maybe_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshward_mesh::LocalMesh;
    use meshward_stream::MemorySink;

    fn parts() -> (LocalMesh, Arc<MemorySink>, Bridge) {
        let mesh = LocalMesh::new();
        let sink = Arc::new(MemorySink::new());
        let bridge = Bridge::with_parts(
            BridgeConfig::default(),
            Arc::new(TrustStore::new("unused.json")),
            sink.clone(),
            Arc::new(mesh.clone()),
        );
        (mesh, sink, bridge)
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let (_mesh, _sink, bridge) = parts();
        assert_eq!(bridge.state(), BridgeState::Init);

        bridge.start().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Running);

        bridge.shutdown().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let (_mesh, _sink, bridge) = parts();
        bridge.start().await.unwrap();
        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::InvalidState { .. })
        ));
        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_mesh_fails_start() {
        let (mesh, _sink, bridge) = parts();
        mesh.set_unreachable(true);
        assert!(matches!(bridge.start().await, Err(BridgeError::Mesh(_))));
        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_mesh, sink, bridge) = parts();
        bridge.start().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        bridge.run(token).await.unwrap();

        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_waits_for_drain() {
        let (_mesh, sink, bridge) = parts();
        bridge.start().await.unwrap();

        let (first, (second, state_after_second)) = tokio::join!(bridge.shutdown(), async {
            let result = bridge.shutdown().await;
            (result, bridge.state())
        });

        first.unwrap();
        second.unwrap();
        assert_eq!(state_after_second, BridgeState::Stopped);
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_row_refused_after_close_is_counted() {
        let (_mesh, _sink, bridge) = parts();
        bridge.writer.close().await.unwrap();

        let handler = AcceptingHandler {
            dedup: Arc::clone(&bridge.dedup),
            writer: Arc::clone(&bridge.writer),
            stats: Arc::clone(&bridge.stats),
        };
        let reading: Reading = serde_json::from_value(serde_json::json!({
            "device_id": "late", "reading_type": "temp", "timestamp": 1000, "value": 1.5
        }))
        .unwrap();
        handler.on_reading(reading, None).await;

        let snap = bridge.stats().snapshot();
        assert_eq!(snap.written, 0);
        assert_eq!(snap.dropped_after_close, 1);
    }

    #[test]
    fn test_init_fails_without_trust_file() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();

        let config = BridgeConfig {
            trust_file: "/nonexistent/trust_list.json".into(),
            ..BridgeConfig::default()
        };
        assert!(matches!(Bridge::init(config), Err(BridgeError::Trust(_))));
    }
}
