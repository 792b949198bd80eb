//! Key expressions for topic subscriptions.
//!
//! Keys are `/`-separated chunks. In an expression `*` matches exactly one
//! chunk and `**` matches zero or more chunks, so `telemetry/v2/live/**`
//! covers every live reading key.

use std::fmt;
use std::str::FromStr;

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyExpr {
    raw: String,
    chunks: Vec<String>,
}

impl KeyExpr {
    pub fn new(raw: &str) -> MeshResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.ends_with('/') {
            return Err(MeshError::InvalidKeyExpr(raw.to_string()));
        }

        let chunks: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        for chunk in &chunks {
            let wildcard_mixed = chunk.contains('*') && chunk != "*" && chunk != "**";
            if chunk.is_empty() || wildcard_mixed {
                return Err(MeshError::InvalidKeyExpr(raw.to_string()));
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            chunks,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete key falls under this expression.
    pub fn matches(&self, key: &str) -> bool {
        let key_chunks: Vec<&str> = key.split('/').collect();
        let pattern: Vec<&str> = self.chunks.iter().map(String::as_str).collect();
        match_chunks(&pattern, &key_chunks)
    }
}

fn match_chunks(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"**", rest)) => (0..=key.len()).any(|skip| match_chunks(rest, &key[skip..])),
        Some((&head, rest)) => match key.split_first() {
            Some((&chunk, key_rest)) => {
                (head == "*" || head == chunk) && match_chunks(rest, key_rest)
            }
            None => false,
        },
    }
}

impl FromStr for KeyExpr {
    type Err = MeshError;

    fn from_str(s: &str) -> MeshResult<Self> {
        Self::new(s)
    }
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
