//! Flood-tolerant deduplication.
//!
//! Mesh relays re-broadcast the same reading many times. The cache records
//! each fingerprint on first sighting and reports later sightings within the
//! horizon as duplicates. Memory is bounded two ways: entries older than the
//! horizon are evicted lazily from the oldest end, and once `max_entries` is
//! exceeded the oldest entries are dropped first.

use meshward_core::DedupFingerprint;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default dedup horizon (1 hour)
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(3600);

/// Default maximum number of tracked fingerprints
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Bounds of the dedup cache.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a fingerprint suppresses repeats
    pub horizon: Duration,
    /// Upper bound on tracked fingerprints
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            horizon: DEFAULT_HORIZON,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Snapshot of dedup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Cumulative duplicates reported
    pub duplicates: u64,
    /// Fingerprints currently tracked
    pub occupancy: usize,
    /// Cumulative entries evicted by expiry or capacity
    pub evicted: u64,
}

#[derive(Default)]
struct DedupState {
    seen: HashMap<DedupFingerprint, Instant>,
    /// First-sighting order; each tracked fingerprint appears exactly once
    order: VecDeque<(DedupFingerprint, Instant)>,
}

impl DedupState {
    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((fingerprint, _)) => {
                self.seen.remove(&fingerprint);
                true
            }
            None => false,
        }
    }

    fn evict_expired(&mut self, now: Instant, horizon: Duration) -> u64 {
        let mut evicted = 0;
        while let Some((_, first_seen)) = self.order.front() {
            if now.saturating_duration_since(*first_seen) < horizon {
                break;
            }
            self.pop_oldest();
            evicted += 1;
        }
        evicted
    }
}

/// Time-windowed, size-bounded set of recently seen fingerprints.
pub struct DeduplicationCache {
    config: DedupConfig,
    state: Mutex<DedupState>,
    duplicates: AtomicU64,
    evicted: AtomicU64,
}

impl DeduplicationCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DedupState::default()),
            duplicates: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Returns true if `fingerprint` was already seen within the horizon
    /// (duplicate), false if it is new and has now been recorded.
    ///
    /// Check and record happen under one lock, so two concurrent calls with
    /// the same fingerprint never both see it as new.
    pub fn check_and_record(&self, fingerprint: &DedupFingerprint) -> bool {
        self.check_and_record_at(fingerprint, Instant::now())
    }

    /// `check_and_record` against an explicit clock reading.
    pub fn check_and_record_at(&self, fingerprint: &DedupFingerprint, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut evicted = state.evict_expired(now, self.config.horizon);

        if state.seen.contains_key(fingerprint) {
            drop(state);
            self.add_evicted(evicted);
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        state.seen.insert(*fingerprint, now);
        state.order.push_back((*fingerprint, now));

        while state.seen.len() > self.config.max_entries {
            if !state.pop_oldest() {
                break;
            }
            evicted += 1;
        }

        drop(state);
        self.add_evicted(evicted);
        false
    }

    /// True if `fingerprint` is tracked and still inside the horizon.
    /// Records nothing and counts nothing.
    pub fn contains(&self, fingerprint: &DedupFingerprint) -> bool {
        self.contains_at(fingerprint, Instant::now())
    }

    pub fn contains_at(&self, fingerprint: &DedupFingerprint, now: Instant) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .seen
            .get(fingerprint)
            .is_some_and(|first_seen| now.saturating_duration_since(*first_seen) < self.config.horizon)
    }

    /// Evict expired entries now. Returns how many were removed.
    pub fn sweep(&self) -> u64 {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> u64 {
        let evicted = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evict_expired(now, self.config.horizon);
        self.add_evicted(evicted);
        evicted
    }

    pub fn stats(&self) -> DedupStats {
        let occupancy = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len();
        DedupStats {
            duplicates: self.duplicates.load(Ordering::Relaxed),
            occupancy,
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    fn add_evicted(&self, n: u64) {
        if n > 0 {
            self.evicted.fetch_add(n, Ordering::Relaxed);
        }
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
