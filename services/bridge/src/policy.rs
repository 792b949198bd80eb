//! Per-reading acceptance policy.
//!
//! Runs once per delivered reading, in this order: dedup, unsigned flag,
//! timestamp, value, row construction. Appending the row is left to the
//! caller so the policy can be exercised without a writer.

use meshward_core::{DedupFingerprint, PersistedRow, Reading, SignedEnvelope};
use meshward_stream::DeduplicationCache;
use tracing::warn;

use crate::stats::BridgeStats;

#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    /// Reading passed every check and should be persisted
    Accept(PersistedRow),
    /// Fingerprint already seen within the dedup horizon
    Duplicate,
    /// Timestamp missing or not a valid instant
    InvalidTimestamp,
    /// Value missing or not numeric
    InvalidValue,
}

impl Acceptance {
    pub fn into_row(self) -> Option<PersistedRow> {
        match self {
            Acceptance::Accept(row) => Some(row),
            _ => None,
        }
    }
}

/// Decide whether a verified reading becomes a row.
///
/// Takes no locks beyond the dedup cache's own.
pub fn accept(
    reading: &Reading,
    envelope: Option<&SignedEnvelope>,
    dedup: &DeduplicationCache,
    stats: &BridgeStats,
) -> Acceptance {
    stats.record_received();

    let fingerprint = DedupFingerprint::from_reading(reading);
    if dedup.check_and_record(&fingerprint) {
        stats.record_duplicate();
        return Acceptance::Duplicate;
    }

    if envelope.is_none() {
        stats.record_unsigned();
    }

    let Some(timestamp) = reading.parsed_timestamp() else {
        stats.record_invalid_timestamp();
        warn!(
            timestamp = %reading.timestamp_key(),
            device_id = reading.device_id(),
            "invalid timestamp, dropping reading"
        );
        return Acceptance::InvalidTimestamp;
    };

    // Expected for malformed upstream data; not logged.
    let Some(value) = reading.parsed_value() else {
        stats.record_invalid_value();
        return Acceptance::InvalidValue;
    };

    Acceptance::Accept(PersistedRow::build(reading, envelope, timestamp, value))
}
