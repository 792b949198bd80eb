//! The 25-column persisted row.

use chrono::{DateTime, Utc};
use crate::reading::{parse_number, Reading, SignedEnvelope};

/// One row of the unified reading schema. Field order is the column order.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRow {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub data_source: String,
    pub network_source: String,
    pub ingestion_node_id: String,
    pub reading_type: String,
    pub value: f64,
    pub unit: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub geo_country: String,
    pub geo_subdivision: String,
    pub board_model: String,
    pub sensor_model: String,
    pub deployment_type: String,
    pub deployment_type_source: String,
    pub transport_type: String,
    pub deployment_location: String,
    pub node_name: String,
    pub node_info: String,
    pub node_info_url: String,
    /// Hex of the originator's signature, empty if unsigned
    pub signature: String,
    /// Originating ingester, empty if unsigned
    pub ingester_id: String,
    /// Originator key version, 0 if unsigned
    pub key_version: u32,
}

impl PersistedRow {
    /// Column names in schema order.
    pub const COLUMNS: [&'static str; 25] = [
        "timestamp",
        "device_id",
        "data_source",
        "network_source",
        "ingestion_node_id",
        "reading_type",
        "value",
        "unit",
        "latitude",
        "longitude",
        "altitude",
        "geo_country",
        "geo_subdivision",
        "board_model",
        "sensor_model",
        "deployment_type",
        "deployment_type_source",
        "transport_type",
        "deployment_location",
        "node_name",
        "node_info",
        "node_info_url",
        "signature",
        "ingester_id",
        "key_version",
    ];

    /// Build a row from an already validated timestamp and value.
    ///
    /// Signature fields are copied from the envelope as received.
    pub fn build(
        reading: &Reading,
        envelope: Option<&SignedEnvelope>,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        let text = |field: &Option<String>| field.clone().unwrap_or_default();
        let number = |field: &Option<serde_json::Value>| field.as_ref().and_then(parse_number);

        let (signature, ingester_id, key_version) = match envelope {
            Some(env) => (env.signature_hex(), env.ingester_id.clone(), env.key_version),
            None => (String::new(), String::new(), 0),
        };

        Self {
            timestamp,
            device_id: text(&reading.device_id),
            data_source: text(&reading.data_source),
            network_source: text(&reading.network_source),
            ingestion_node_id: text(&reading.ingestion_node_id),
            reading_type: text(&reading.reading_type),
            value,
            unit: text(&reading.unit),
            latitude: number(&reading.latitude),
            longitude: number(&reading.longitude),
            altitude: number(&reading.altitude),
            geo_country: text(&reading.geo_country),
            geo_subdivision: text(&reading.geo_subdivision),
            board_model: text(&reading.board_model),
            sensor_model: text(&reading.sensor_model),
            deployment_type: text(&reading.deployment_type),
            deployment_type_source: text(&reading.deployment_type_source),
            transport_type: text(&reading.transport_type),
            deployment_location: text(&reading.deployment_location),
            node_name: text(&reading.node_name),
            node_info: text(&reading.node_info),
            node_info_url: text(&reading.node_info_url),
            signature,
            ingester_id,
            key_version,
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}
