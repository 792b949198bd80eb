//! Dedup fingerprints.

use std::fmt;

use crate::reading::Reading;

/// Identity of a physical observation: (device, reading kind, timestamp).
///
/// Stored as a BLAKE3 digest of the length-prefixed parts so every cache
/// entry has the same size no matter how long the identifiers are.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupFingerprint([u8; 32]);

impl DedupFingerprint {
    pub fn new(device_id: &str, reading_type: &str, timestamp: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in [device_id, reading_type, timestamp] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_reading(reading: &Reading) -> Self {
        Self::new(
            reading.device_id(),
            reading.reading_type(),
            &reading.fingerprint_timestamp(),
        )
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for DedupFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupFingerprint({})", hex::encode(&self.0[..8]))
    }
}
