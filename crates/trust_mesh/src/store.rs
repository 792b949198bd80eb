//! Reloadable trust store.
//!
//! The live registry is an immutable snapshot behind `RwLock<Arc<_>>`.
//! Verifiers hold the read lock only long enough to clone the `Arc`; a reload
//! parses the new document first and holds the write lock only for the swap,
//! so no verification ever observes a partially updated key set.

use ed25519_dalek::Signature;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::{TrustLoadError, TrustResult};
use crate::registry::TrustRegistry;

/// Verifies originator signatures against the current trust registry.
pub struct TrustStore {
    path: PathBuf,
    current: RwLock<Arc<TrustRegistry>>,
    generation: AtomicU64,
}

impl TrustStore {
    /// Create a store backed by `path`. Until `load` succeeds the store is
    /// empty and every signed reading is untrusted.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(Arc::new(TrustRegistry::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry file and install it.
    ///
    /// On failure the previously installed snapshot stays live and the caller
    /// decides whether to continue without trust or abort.
    pub fn load(&self) -> TrustResult<usize> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| TrustLoadError::Io {
            path: self.path.clone(),
            source,
        })?;
        let registry = TrustRegistry::from_json(&raw)?;
        let entries = registry.len();
        let active = registry.active_count();
        let generation = self.install(registry);

        info!(
            path = %self.path.display(),
            entries,
            active,
            generation,
            "trust registry loaded"
        );
        Ok(entries)
    }

    /// Atomically replace the live registry. Returns the new generation.
    pub fn install(&self, registry: TrustRegistry) -> u64 {
        let next = Arc::new(registry);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current registry snapshot.
    pub fn snapshot(&self) -> Arc<TrustRegistry> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Number of successful installs since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Check `signature` over `message` for (originator, key version).
    ///
    /// Returns false for unknown identities, revoked or expired keys, and
    /// signatures that do not verify. Never errors.
    pub fn verify(
        &self,
        originator_id: &str,
        key_version: u32,
        message: &[u8],
        signature: &[u8],
    ) -> bool {
        let snapshot = self.snapshot();

        let Some(entry) = snapshot.get(originator_id, key_version) else {
            debug!(originator_id, key_version, "no trust entry for originator");
            return false;
        };

        if !entry.is_usable(now_secs()) {
            debug!(
                originator_id,
                key_version,
                status = ?entry.status,
                "trust entry not usable"
            );
            return false;
        }

        let Ok(signature) = Signature::from_slice(signature) else {
            debug!(originator_id, len = signature.len(), "signature has wrong length");
            return false;
        };

        entry.key.verify_strict(message, &signature).is_ok()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
