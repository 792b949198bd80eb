//! Reading and envelope types decoded from mesh payloads.
//!
//! A mesh payload is a JSON object. Signed traffic wraps the reading:
//!
//! ```json
//! { "reading": { "device_id": "a", ... }, "signature": "<hex>", "ingester_id": "wsi_1", "key_version": 2 }
//! ```
//!
//! A payload without a `reading` key is itself an (unsigned) reading.
//! Signatures cover the canonical bytes of the reading object: compact JSON
//! with object keys sorted at every level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// A single decoded sensor observation.
///
/// Every field is optional at decode time. `timestamp`, `value` and the
/// geolocation fields keep the raw JSON scalar so that normalization can
/// decide what is acceptable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: Option<Value>,
    pub device_id: Option<String>,
    pub reading_type: Option<String>,
    pub value: Option<Value>,
    pub unit: Option<String>,
    pub data_source: Option<String>,
    pub network_source: Option<String>,
    pub ingestion_node_id: Option<String>,
    pub latitude: Option<Value>,
    pub longitude: Option<Value>,
    pub altitude: Option<Value>,
    pub geo_country: Option<String>,
    pub geo_subdivision: Option<String>,
    pub board_model: Option<String>,
    pub sensor_model: Option<String>,
    pub deployment_type: Option<String>,
    pub deployment_type_source: Option<String>,
    pub transport_type: Option<String>,
    pub deployment_location: Option<String>,
    pub node_name: Option<String>,
    pub node_info: Option<String>,
    pub node_info_url: Option<String>,
}

impl Reading {
    /// Device identity, empty when absent.
    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or("")
    }

    /// Reading kind, empty when absent.
    pub fn reading_type(&self) -> &str {
        self.reading_type.as_deref().unwrap_or("")
    }

    /// Textual form of the raw timestamp, as received.
    pub fn timestamp_key(&self) -> String {
        match &self.timestamp {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Timestamp component of the dedup fingerprint.
    ///
    /// Whole epoch seconds when the timestamp parses, so `1000`, `1000.0`
    /// and `"1000"` share one key. Unparseable input falls back to the raw
    /// text.
    pub fn fingerprint_timestamp(&self) -> String {
        match self.parsed_timestamp() {
            Some(ts) => ts.timestamp().to_string(),
            None => self.timestamp_key(),
        }
    }

    /// Timestamp as a UTC instant, if it parses.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().and_then(parse_timestamp)
    }

    /// Reading value as a finite number, if present and numeric.
    pub fn parsed_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(parse_number)
    }
}

/// Originator signature carried alongside a reading. Never produced locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// Raw ed25519 signature bytes
    pub signature: Vec<u8>,
    /// Identity of the originating ingester
    pub ingester_id: String,
    /// Key version the originator signed with
    pub key_version: u32,
}

impl SignedEnvelope {
    /// Hex form stored in the signature column.
    pub fn signature_hex(&self) -> String {
        hex::encode(&self.signature)
    }
}

/// A mesh payload after decoding, ready for verification.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub reading: Reading,
    /// Canonical bytes of the reading object, the signed message
    pub canonical: Vec<u8>,
    pub envelope: Option<SignedEnvelope>,
}

impl DecodedMessage {
    /// Decode a JSON mesh payload.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(mut outer) = value else {
            return Err(CoreError::Malformed("payload is not a JSON object".into()));
        };

        let (reading_value, envelope) = match outer.remove("reading") {
            Some(reading @ Value::Object(_)) => {
                let envelope = decode_envelope(&outer)?;
                (reading, envelope)
            }
            Some(_) => {
                return Err(CoreError::Malformed("'reading' is not an object".into()));
            }
            None => (Value::Object(outer), None),
        };

        let canonical = canonical_bytes(&reading_value)?;
        let reading: Reading = serde_json::from_value(reading_value)?;

        Ok(Self {
            reading,
            canonical,
            envelope,
        })
    }
}

fn decode_envelope(outer: &Map<String, Value>) -> CoreResult<Option<SignedEnvelope>> {
    let signature = match outer.get("signature") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.is_empty() => return Ok(None),
        Some(Value::String(s)) => hex::decode(s)?,
        Some(_) => return Err(CoreError::Malformed("'signature' is not a string".into())),
    };

    let ingester_id = match outer.get("ingester_id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(CoreError::Malformed(
                "signed payload without 'ingester_id'".into(),
            ))
        }
    };

    let key_version = outer
        .get("key_version")
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| CoreError::Malformed("signed payload without valid 'key_version'".into()))?;

    Ok(Some(SignedEnvelope {
        signature,
        ingester_id,
        key_version,
    }))
}

/// Canonical byte form of a reading object: compact JSON, keys sorted.
pub fn canonical_bytes(reading: &Value) -> CoreResult<Vec<u8>> {
    // serde_json's default map is ordered by key
    Ok(serde_json::to_vec(reading)?)
}

/// Encode a mesh payload, wrapping the reading when an envelope is given.
pub fn encode_message(reading: &Value, envelope: Option<&SignedEnvelope>) -> CoreResult<Vec<u8>> {
    let payload = match envelope {
        Some(env) => serde_json::json!({
            "reading": reading,
            "signature": env.signature_hex(),
            "ingester_id": env.ingester_id,
            "key_version": env.key_version,
        }),
        None => reading.clone(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Parse integer epoch seconds.
///
/// JSON numbers with a fraction are truncated. Strings must hold an integer.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    let secs = match raw {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => truncate(n.as_f64()?)?,
        },
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

fn truncate(f: f64) -> Option<i64> {
    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f.trunc() as i64)
    } else {
        None
    }
}

/// Parse a finite number from a JSON number or numeric string.
pub fn parse_number(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
