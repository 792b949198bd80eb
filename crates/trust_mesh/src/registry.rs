//! Trust registry document and entries.
//!
//! The registry maps an originator identity and key version to an ed25519
//! verification key and a validity status:
//!
//! ```json
//! {
//!   "ingesters": {
//!     "wsi_abc": {
//!       "1": { "public_key": "<base64>", "status": "revoked" },
//!       "2": { "public_key": "<base64>", "status": "active", "expires_at": 1767225600 }
//!     }
//!   }
//! }
//! ```

use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{TrustLoadError, TrustResult};

/// Validity status of a registered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    ingesters: HashMap<String, HashMap<String, EntryDocument>>,
}

#[derive(Debug, Deserialize)]
struct EntryDocument {
    public_key: String,
    status: KeyStatus,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// A verification key registered for (originator, key version).
#[derive(Debug, Clone)]
pub struct TrustEntry {
    pub ingester_id: String,
    pub key_version: u32,
    pub key: VerifyingKey,
    pub status: KeyStatus,
    /// Unix seconds after which an active key is treated as expired
    pub expires_at: Option<i64>,
}

impl TrustEntry {
    /// Whether signatures made with this key are currently accepted.
    pub fn is_usable(&self, now_secs: i64) -> bool {
        match self.status {
            KeyStatus::Active => self.expires_at.map_or(true, |exp| now_secs < exp),
            KeyStatus::Revoked | KeyStatus::Expired => false,
        }
    }
}

/// Immutable set of trust entries.
#[derive(Debug, Clone, Default)]
pub struct TrustRegistry {
    entries: HashMap<(String, u32), TrustEntry>,
}

impl TrustRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a registry document, validating every entry.
    pub fn from_json(raw: &str) -> TrustResult<Self> {
        let document: RegistryDocument = serde_json::from_str(raw)?;
        let mut registry = Self::new();

        for (ingester_id, versions) in document.ingesters {
            for (version, entry) in versions {
                let invalid = |reason: String| TrustLoadError::InvalidEntry {
                    ingester_id: ingester_id.clone(),
                    key_version: version.clone(),
                    reason,
                };

                let key_version: u32 = version
                    .trim()
                    .parse()
                    .map_err(|_| invalid("key version is not a non-negative integer".into()))?;

                let key_bytes = base64::engine::general_purpose::STANDARD
                    .decode(entry.public_key.trim())
                    .map_err(|e| invalid(format!("public key is not base64: {}", e)))?;
                let key_array: [u8; 32] = key_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| invalid(format!("public key is {} bytes, expected 32", key_bytes.len())))?;
                let key = VerifyingKey::from_bytes(&key_array)
                    .map_err(|e| invalid(format!("public key rejected: {}", e)))?;

                registry.insert(TrustEntry {
                    ingester_id: ingester_id.clone(),
                    key_version,
                    key,
                    status: entry.status,
                    expires_at: entry.expires_at,
                });
            }
        }

        Ok(registry)
    }

    pub fn insert(&mut self, entry: TrustEntry) {
        self.entries
            .insert((entry.ingester_id.clone(), entry.key_version), entry);
    }

    pub fn get(&self, ingester_id: &str, key_version: u32) -> Option<&TrustEntry> {
        // Tuple keys need an owned lookup; ids are short
        self.entries.get(&(ingester_id.to_string(), key_version))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries whose status is `active`.
    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == KeyStatus::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn encoded_key(seed: u8) -> String {
        let key = SigningKey::from_bytes(&[seed; 32]);
        base64::engine::general_purpose::STANDARD.encode(key.verifying_key().as_bytes())
    }

    #[test]
    fn test_parse_registry() {
        let raw = format!(
            r#"{{"ingesters":{{"wsi_1":{{"1":{{"public_key":"{}","status":"revoked"}},"2":{{"public_key":"{}","status":"active"}}}}}}}}"#,
            encoded_key(1),
            encoded_key(2)
        );
        let registry = TrustRegistry::from_json(&raw).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.get("wsi_1", 1).unwrap().status, KeyStatus::Revoked);
        assert!(registry.get("wsi_1", 3).is_none());
        assert!(registry.get("wsi_2", 2).is_none());
    }

    #[test]
    fn test_empty_document_is_valid() {
        let registry = TrustRegistry::from_json("{}").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(matches!(
            TrustRegistry::from_json("{not json"),
            Err(TrustLoadError::Parse(_))
        ));
    }

    #[test]
    fn test_bad_key_version_rejected() {
        let raw = format!(
            r#"{{"ingesters":{{"wsi_1":{{"v1":{{"public_key":"{}","status":"active"}}}}}}}}"#,
            encoded_key(1)
        );
        assert!(matches!(
            TrustRegistry::from_json(&raw),
            Err(TrustLoadError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn test_short_key_rejected() {
        let raw = r#"{"ingesters":{"wsi_1":{"1":{"public_key":"AAAA","status":"active"}}}}"#;
        let err = TrustRegistry::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("expected 32"));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let raw = format!(
            r#"{{"ingesters":{{"wsi_1":{{"1":{{"public_key":"{}","status":"pending"}}}}}}}}"#,
            encoded_key(1)
        );
        assert!(TrustRegistry::from_json(&raw).is_err());
    }

    #[test]
    fn test_entry_usability() {
        let key = SigningKey::from_bytes(&[3; 32]).verifying_key();
        let mut entry = TrustEntry {
            ingester_id: "wsi_1".into(),
            key_version: 1,
            key,
            status: KeyStatus::Active,
            expires_at: None,
        };
        assert!(entry.is_usable(1_000));

        entry.expires_at = Some(2_000);
        assert!(entry.is_usable(1_999));
        assert!(!entry.is_usable(2_000));

        entry.expires_at = None;
        entry.status = KeyStatus::Expired;
        assert!(!entry.is_usable(0));
    }
}
