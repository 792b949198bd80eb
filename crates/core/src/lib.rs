//! Core functionality for the Meshward ingestion bridge.
//!
//! This crate provides the reading data model shared across the workspace:
//! decoded readings and their originator envelopes, dedup fingerprints, the
//! 25-column persisted row, and logging initialization.

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod reading;
pub mod row;

pub use error::{CoreError, CoreResult};
pub use fingerprint::DedupFingerprint;
pub use logging::LogFormat;
pub use reading::{
    canonical_bytes, encode_message, parse_number, parse_timestamp, DecodedMessage, Reading,
    SignedEnvelope,
};
pub use row::PersistedRow;
