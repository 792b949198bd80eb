//! Meshward Bridge - trust-verified ingestion from the telemetry mesh
//!
//! Wires the subscriber, acceptance policy and buffered writer together and
//! owns their lifecycle.

pub mod bridge;
pub mod config;
pub mod error;
pub mod policy;
pub mod stats;

pub use bridge::{Bridge, BridgeState};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use policy::{accept, Acceptance};
pub use stats::{BridgeStats, BridgeStatsSnapshot, StatsReport};
