//! Bridge counters and the periodic STATS line.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use meshward_mesh::SubscriberStats;
use meshward_stream::{DedupStats, WriterStats};

/// Acceptance counters, updated from the delivery worker and read by the
/// stats tick without locking.
#[derive(Debug, Default)]
pub struct BridgeStats {
    received: AtomicU64,
    written: AtomicU64,
    duplicates: AtomicU64,
    unsigned: AtomicU64,
    invalid_timestamp: AtomicU64,
    invalid_value: AtomicU64,
    dropped_after_close: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    pub received: u64,
    pub written: u64,
    pub duplicates: u64,
    pub unsigned: u64,
    pub invalid_timestamp: u64,
    pub invalid_value: u64,
    /// Accepted rows refused because the writer had already closed
    pub dropped_after_close: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsigned(&self) {
        self.unsigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_timestamp(&self) {
        self.invalid_timestamp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_value(&self) {
        self.invalid_value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_after_close(&self) {
        self.dropped_after_close.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unsigned: self.unsigned.load(Ordering::Relaxed),
            invalid_timestamp: self.invalid_timestamp.load(Ordering::Relaxed),
            invalid_value: self.invalid_value.load(Ordering::Relaxed),
            dropped_after_close: self.dropped_after_close.load(Ordering::Relaxed),
        }
    }
}

/// Everything reported on one stats tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub bridge: BridgeStatsSnapshot,
    pub subscriber: SubscriberStats,
    pub writer: WriterStats,
    pub dedup: DedupStats,
}

impl StatsReport {
    /// Emit the report as one info record with structured fields.
    pub fn log(&self) {
        tracing::info!(
            received = self.bridge.received,
            written = self.bridge.written,
            duplicates = self.bridge.duplicates,
            unsigned = self.bridge.unsigned,
            invalid_timestamp = self.bridge.invalid_timestamp,
            invalid_value = self.bridge.invalid_value,
            dropped_after_close = self.bridge.dropped_after_close,
            sub_verified = self.subscriber.verified,
            sub_rejected = self.subscriber.rejected,
            sub_malformed = self.subscriber.malformed,
            sub_skipped = self.subscriber.skipped,
            ch_written = self.writer.total_written,
            ch_buffer = self.writer.buffer_size,
            failed_batches = self.writer.failed_batches,
            rows_lost = self.writer.rows_lost,
            dedup_occupancy = self.dedup.occupancy,
            "{}",
            self
        );
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATS | received={} | written={} | duplicates={} | unsigned={} | \
             sub_verified={} | sub_rejected={} | ch_written={} | ch_buffer={}",
            self.bridge.received,
            self.bridge.written,
            self.bridge.duplicates,
            self.bridge.unsigned,
            self.subscriber.verified,
            self.subscriber.rejected,
            self.writer.total_written,
            self.writer.buffer_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = BridgeStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_duplicate();
        stats.record_unsigned();
        stats.record_written();
        stats.record_dropped_after_close();

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.unsigned, 1);
        assert_eq!(snap.written, 1);
        assert_eq!(snap.invalid_timestamp, 0);
        assert_eq!(snap.dropped_after_close, 1);
    }

    #[test]
    fn test_stats_line_format() {
        let report = StatsReport {
            bridge: BridgeStatsSnapshot {
                received: 10,
                written: 7,
                duplicates: 2,
                unsigned: 3,
                ..Default::default()
            },
            subscriber: SubscriberStats {
                verified: 9,
                rejected: 1,
                ..Default::default()
            },
            writer: WriterStats {
                total_written: 5,
                buffer_size: 2,
                ..Default::default()
            },
            dedup: DedupStats::default(),
        };

        assert_eq!(
            report.to_string(),
            "STATS | received=10 | written=7 | duplicates=2 | unsigned=3 | \
             sub_verified=9 | sub_rejected=1 | ch_written=5 | ch_buffer=2"
        );
    }
}
