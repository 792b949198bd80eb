//! WebSocket JSON mesh client.
//!
//! The router speaks a small JSON protocol over text frames:
//!
//! ```text
//! -> {"op":"subscribe","key_expr":"telemetry/v2/live/**"}
//! <- {"key":"telemetry/v2/live/nz/dev-1","payload":{...}}
//! ```
//!
//! `payload` is either the mesh message object itself or a string holding
//! it. Each subscription owns a session task that reconnects with bounded
//! exponential backoff and re-sends its subscribe frame.
//!
//! When the delivery channel is full the session parks matching samples in a
//! local backlog (as large as the channel) and keeps reading, so router pings
//! are still answered while the consumer catches up. Only once the backlog is
//! also full does the session stop reading the socket; a consumer stalled
//! that long can lose the session to the router's keepalive timeout.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::key_expr::KeyExpr;
use crate::transport::{MeshSample, MeshTransport, DEFAULT_CHANNEL_CAPACITY};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    op: &'static str,
    key_expr: &'a str,
}

#[derive(Debug, Deserialize)]
struct SampleFrame {
    key: String,
    payload: Value,
}

impl SampleFrame {
    fn into_sample(self) -> MeshResult<MeshSample> {
        let payload = match self.payload {
            Value::String(s) => s.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        Ok(MeshSample::new(self.key, payload))
    }
}

pub struct WsTransport {
    endpoint: String,
    capacity: usize,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    /// Stream opened by `connect`, handed to the first subscription
    pending: Mutex<Option<WsStream>>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_capacity(endpoint, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(endpoint: impl Into<String>, capacity: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            capacity: capacity.max(1),
            policy: ReconnectPolicy::default(),
            cancel: CancellationToken::new(),
            pending: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open(&self) -> MeshResult<WsStream> {
        open_stream(&self.endpoint).await
    }
}

async fn open_stream(endpoint: &str) -> MeshResult<WsStream> {
    let (stream, _response) =
        connect_async(endpoint)
            .await
            .map_err(|e| MeshError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
    Ok(stream)
}

#[async_trait]
impl MeshTransport for WsTransport {
    async fn connect(&self) -> MeshResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MeshError::Closed);
        }
        let stream = self.open().await?;
        info!(endpoint = %self.endpoint, "connected to mesh router");
        *self.pending.lock().await = Some(stream);
        Ok(())
    }

    async fn subscribe(&self, key_expr: &KeyExpr) -> MeshResult<mpsc::Receiver<MeshSample>> {
        if self.cancel.is_cancelled() {
            return Err(MeshError::Closed);
        }

        let pending = self.pending.lock().await.take();
        let stream = match pending {
            Some(stream) => stream,
            None => self.open().await?,
        };

        let (tx, rx) = mpsc::channel(self.capacity);
        let session = Session {
            endpoint: self.endpoint.clone(),
            key_expr: key_expr.clone(),
            policy: self.policy,
            cancel: self.cancel.child_token(),
            backlog_limit: self.capacity,
            tx,
        };
        let handle = tokio::spawn(session.run(stream));
        self.sessions.lock().await.push(handle);

        Ok(rx)
    }

    async fn close(&self) -> MeshResult<()> {
        self.cancel.cancel();

        if let Some(mut stream) = self.pending.lock().await.take() {
            let _ = stream.close(None).await;
        }

        let sessions: Vec<JoinHandle<()>> = self.sessions.lock().await.drain(..).collect();
        for handle in sessions {
            if let Err(e) = handle.await {
                warn!(error = %e, "mesh session task ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    endpoint: String,
    key_expr: KeyExpr,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    /// Samples held locally while the channel is full
    backlog_limit: usize,
    tx: mpsc::Sender<MeshSample>,
}

enum SessionEnd {
    /// Subscriber or transport is gone, stop for good
    Finished,
    /// Connection dropped, reconnect
    Lost,
}

impl Session {
    async fn run(self, first: WsStream) {
        let mut stream = Some(first);
        let mut delay = self.policy.initial;
        let mut backlog = VecDeque::new();

        loop {
            let ws = match stream.take() {
                Some(ws) => ws,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match open_stream(&self.endpoint).await {
                        Ok(ws) => {
                            info!(endpoint = %self.endpoint, "reconnected to mesh router");
                            ws
                        }
                        Err(e) => {
                            warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "mesh reconnect failed");
                            delay = self.policy.next(delay);
                            continue;
                        }
                    }
                }
            };

            match self.pump(ws, &mut backlog).await {
                Ok(SessionEnd::Finished) => return,
                Ok(SessionEnd::Lost) => {
                    delay = self.policy.initial;
                    warn!(endpoint = %self.endpoint, "mesh connection lost");
                }
                Err(e) => {
                    warn!(error = %e, "mesh session error");
                }
            }

            if !self.drain(&mut backlog).await {
                return;
            }
        }
    }

    /// Deliver parked samples before reconnecting. Returns false if the
    /// session should stop.
    async fn drain(&self, backlog: &mut VecDeque<MeshSample>) -> bool {
        while let Some(sample) = backlog.pop_front() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                sent = self.tx.send(sample) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Subscribe on one connection and forward frames until it ends.
    ///
    /// Pings are answered by tungstenite itself on the next read, so the
    /// socket is polled whenever the backlog has room.
    async fn pump(
        &self,
        ws: WsStream,
        backlog: &mut VecDeque<MeshSample>,
    ) -> MeshResult<SessionEnd> {
        let (mut sender, mut receiver) = ws.split();

        let frame = serde_json::to_string(&SubscribeFrame {
            op: "subscribe",
            key_expr: self.key_expr.as_str(),
        })?;
        sender.send(Message::Text(frame)).await?;
        debug!(key_expr = %self.key_expr, "subscribe frame sent");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Finished);
                }

                permit = self.tx.reserve(), if !backlog.is_empty() => {
                    let Ok(permit) = permit else {
                        return Ok(SessionEnd::Finished);
                    };
                    if let Some(sample) = backlog.pop_front() {
                        permit.send(sample);
                    }
                }

                msg = receiver.next(), if backlog.len() < self.backlog_limit => {
                    let Some(msg) = msg else {
                        return Ok(SessionEnd::Lost);
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            if !self.forward(text.as_bytes(), backlog) {
                                return Ok(SessionEnd::Finished);
                            }
                        }
                        Ok(Message::Binary(bytes)) => {
                            if !self.forward(&bytes, backlog) {
                                return Ok(SessionEnd::Finished);
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!(endpoint = %self.endpoint, "mesh router closed connection");
                            return Ok(SessionEnd::Lost);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "error receiving from mesh router");
                            return Ok(SessionEnd::Lost);
                        }
                    }
                }
            }
        }
    }

    /// Hand a matching sample to the channel, or park it in the backlog when
    /// the channel is full. Returns false once the receiving side is gone.
    fn forward(&self, frame: &[u8], backlog: &mut VecDeque<MeshSample>) -> bool {
        let sample = match serde_json::from_slice::<SampleFrame>(frame)
            .map_err(MeshError::from)
            .and_then(SampleFrame::into_sample)
        {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "dropping unparseable mesh frame");
                return true;
            }
        };

        if !self.key_expr.matches(&sample.key) {
            return true;
        }

        if !backlog.is_empty() {
            backlog.push_back(sample);
            return true;
        }

        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(sample)) => {
                backlog.push_back(sample);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
