//! Bridge configuration.
//!
//! Values come from an optional TOML file, then environment overrides, then
//! validation. Every field has a default so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use meshward_core::LogFormat;
use meshward_mesh::DEFAULT_CHANNEL_CAPACITY;
use meshward_stream::{DedupConfig, WriterConfig};

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds between STATS lines
    pub stats_interval_secs: u64,
    pub trust_file: PathBuf,
    /// Seconds between trust registry reloads, 0 disables
    pub trust_reload_secs: u64,
    pub subscribe_key: String,
    pub log_level: String,
    /// `plain` or `json`
    pub log_format: String,
    pub mesh: MeshSection,
    pub sink: SinkSection,
    pub writer: WriterSection,
    pub dedup: DedupSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    /// WebSocket URL of the mesh router
    pub endpoint: String,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    /// SQLite database file
    pub path: PathBuf,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSection {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_buffered_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub horizon_secs: u64,
    pub max_entries: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            trust_file: PathBuf::from("data/trust_list.json"),
            trust_reload_secs: 0,
            subscribe_key: "telemetry/v2/live/**".to_string(),
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
            mesh: MeshSection::default(),
            sink: SinkSection::default(),
            writer: WriterSection::default(),
            dedup: DedupSection::default(),
        }
    }
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:7447/mesh".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/readings.db"),
            table: "sensor_readings".to_string(),
        }
    }
}

impl Default for WriterSection {
    fn default() -> Self {
        let defaults = WriterConfig::default();
        Self {
            batch_size: defaults.batch_size,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
            max_attempts: defaults.max_attempts,
            retry_backoff_ms: defaults.retry_backoff.as_millis() as u64,
            max_buffered_rows: defaults.max_buffered_rows,
        }
    }
}

impl Default for DedupSection {
    fn default() -> Self {
        let defaults = DedupConfig::default();
        Self {
            horizon_secs: defaults.horizon.as_secs(),
            max_entries: defaults.max_entries,
        }
    }
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// File (if given), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup such as the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("STATS_INTERVAL") {
            self.stats_interval_secs = raw.trim().parse().map_err(|_| {
                BridgeError::InvalidConfig(format!("STATS_INTERVAL is not a number: {raw}"))
            })?;
        }
        if let Some(path) = lookup("TRUST_FILE") {
            self.trust_file = PathBuf::from(path);
        }
        if let Some(key) = lookup("MESH_SUBSCRIBE_KEY") {
            self.subscribe_key = key;
        }
        if let Some(endpoint) = lookup("MESH_ENDPOINT") {
            self.mesh.endpoint = endpoint;
        }
        if let Some(path) = lookup("SQLITE_PATH") {
            self.sink.path = PathBuf::from(path);
        }
        if let Some(table) = lookup("SQLITE_TABLE") {
            self.sink.table = table;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.log_format = format;
        }
        Ok(())
    }

    pub fn validate(&self) -> BridgeResult<()> {
        let nonzero = [
            ("stats_interval_secs", self.stats_interval_secs == 0),
            ("mesh.channel_capacity", self.mesh.channel_capacity == 0),
            ("writer.batch_size", self.writer.batch_size == 0),
            ("writer.flush_interval_ms", self.writer.flush_interval_ms == 0),
            ("writer.max_attempts", self.writer.max_attempts == 0),
            ("writer.max_buffered_rows", self.writer.max_buffered_rows == 0),
            ("dedup.horizon_secs", self.dedup.horizon_secs == 0),
            ("dedup.max_entries", self.dedup.max_entries == 0),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(BridgeError::InvalidConfig(format!("{name} must be greater than zero")));
        }

        if self.writer.max_buffered_rows < self.writer.batch_size {
            return Err(BridgeError::InvalidConfig(
                "writer.max_buffered_rows must be at least writer.batch_size".into(),
            ));
        }
        if self.subscribe_key.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("subscribe_key is empty".into()));
        }
        if self.mesh.endpoint.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("mesh.endpoint is empty".into()));
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn trust_reload_interval(&self) -> Option<Duration> {
        (self.trust_reload_secs > 0).then(|| Duration::from_secs(self.trust_reload_secs))
    }

    pub fn log_format(&self) -> LogFormat {
        LogFormat::parse(&self.log_format)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.writer.batch_size,
            flush_interval: Duration::from_millis(self.writer.flush_interval_ms),
            max_attempts: self.writer.max_attempts,
            retry_backoff: Duration::from_millis(self.writer.retry_backoff_ms),
            max_buffered_rows: self.writer.max_buffered_rows,
            ..WriterConfig::default()
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            horizon: Duration::from_secs(self.dedup.horizon_secs),
            max_entries: self.dedup.max_entries,
        }
    }
}
