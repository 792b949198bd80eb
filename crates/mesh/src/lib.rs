//! Meshward Mesh - subscription side of the telemetry mesh
//!
//! Provides key expressions, the [`MeshTransport`] seam with an in-process
//! and a WebSocket implementation, and the [`MeshSubscriber`] that verifies
//! originator signatures before handing readings on.

pub mod error;
pub mod key_expr;
pub mod local;
pub mod subscriber;
pub mod transport;
pub mod websocket;

pub use error::{MeshError, MeshResult};
pub use key_expr::KeyExpr;
pub use local::LocalMesh;
pub use subscriber::{MeshSubscriber, ReadingHandler, SubscriberStats};
pub use transport::{MeshSample, MeshTransport, DEFAULT_CHANNEL_CAPACITY};
pub use websocket::{ReconnectPolicy, WsTransport};
