//! Durable row sinks.
//!
//! The writer depends only on [`RowSink`]: a batched insert against the
//! fixed 25-column schema plus a close. [`SqliteSink`] is the bundled
//! durable backend; [`MemorySink`] records batches in memory.

use async_trait::async_trait;
use meshward_core::PersistedRow;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::{SinkError, SinkResult};

/// Destination for batches of persisted rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Write one batch. Either the whole batch is durable or an error is
    /// returned and the caller may retry it.
    async fn write_batch(&self, rows: &[PersistedRow]) -> SinkResult<()>;

    /// Release the sink connection.
    async fn close(&self) -> SinkResult<()>;
}

/// SQLite-backed sink. One table, one row per accepted reading.
pub struct SqliteSink {
    conn: Arc<Mutex<Option<Connection>>>,
    insert_sql: String,
    table: String,
}

impl SqliteSink {
    /// Open (or create) the database at `path` and ensure the table exists.
    pub fn open<P: AsRef<Path>>(path: P, table: &str) -> SinkResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let sink = Self::with_connection(conn, table)?;
        info!(path = %path.as_ref().display(), table, "sqlite sink opened");
        Ok(sink)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory(table: &str) -> SinkResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> SinkResult<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SinkError::InvalidTable(table.to_string()));
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    timestamp INTEGER NOT NULL,
                    device_id TEXT NOT NULL,
                    data_source TEXT NOT NULL,
                    network_source TEXT NOT NULL,
                    ingestion_node_id TEXT NOT NULL,
                    reading_type TEXT NOT NULL,
                    value REAL NOT NULL,
                    unit TEXT NOT NULL,
                    latitude REAL,
                    longitude REAL,
                    altitude REAL,
                    geo_country TEXT NOT NULL,
                    geo_subdivision TEXT NOT NULL,
                    board_model TEXT NOT NULL,
                    sensor_model TEXT NOT NULL,
                    deployment_type TEXT NOT NULL,
                    deployment_type_source TEXT NOT NULL,
                    transport_type TEXT NOT NULL,
                    deployment_location TEXT NOT NULL,
                    node_name TEXT NOT NULL,
                    node_info TEXT NOT NULL,
                    node_info_url TEXT NOT NULL,
                    signature TEXT NOT NULL,
                    ingester_id TEXT NOT NULL,
                    key_version INTEGER NOT NULL
                )"
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_device_ts ON {table}(device_id, timestamp)"
            ),
            [],
        )?;

        let placeholders: Vec<String> = (1..=PersistedRow::COLUMNS.len())
            .map(|i| format!("?{}", i))
            .collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            PersistedRow::COLUMNS.join(", "),
            placeholders.join(", ")
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            insert_sql,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of rows currently stored.
    pub fn count_rows(&self) -> SinkResult<u64> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(SinkError::Closed)?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    /// Signature column values in insertion order.
    pub fn signatures(&self) -> SinkResult<Vec<String>> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(SinkError::Closed)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT signature FROM {} ORDER BY rowid",
            self.table
        ))?;
        let signatures = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(signatures)
    }
}

fn insert_batch(conn: &mut Connection, sql: &str, rows: &[PersistedRow]) -> SinkResult<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for row in rows {
            stmt.execute(params![
                row.timestamp.timestamp(),
                row.device_id,
                row.data_source,
                row.network_source,
                row.ingestion_node_id,
                row.reading_type,
                row.value,
                row.unit,
                row.latitude,
                row.longitude,
                row.altitude,
                row.geo_country,
                row.geo_subdivision,
                row.board_model,
                row.sensor_model,
                row.deployment_type,
                row.deployment_type_source,
                row.transport_type,
                row.deployment_location,
                row.node_name,
                row.node_info,
                row.node_info_url,
                row.signature,
                row.ingester_id,
                row.key_version,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl RowSink for SqliteSink {
    async fn write_batch(&self, rows: &[PersistedRow]) -> SinkResult<()> {
        let conn = Arc::clone(&self.conn);
        let sql = self.insert_sql.clone();
        let rows = rows.to_vec();

        tokio::task::spawn_blocking(move || -> SinkResult<()> {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_mut().ok_or(SinkError::Closed)?;
            insert_batch(conn, &sql, &rows)?;
            debug!(rows = rows.len(), "batch inserted");
            Ok(())
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))?
    }

    async fn close(&self) -> SinkResult<()> {
        let taken = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| SinkError::Database(e))?;
            info!(table = %self.table, "sqlite sink closed");
        }
        Ok(())
    }
}

/// Sink that keeps rows in memory. Can be told to fail upcoming writes.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<PersistedRow>>,
    batches: AtomicU64,
    fail_next: AtomicU32,
    attempts: AtomicU64,
    closes: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<PersistedRow> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Write attempts including failed ones.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn write_batch(&self, rows: &[PersistedRow]) -> SinkResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SinkError::Unavailable("injected failure".into()));
        }

        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(rows);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> SinkResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use meshward_core::{Reading, SignedEnvelope};

    fn row(device: &str, envelope: Option<&SignedEnvelope>) -> PersistedRow {
        let reading = Reading {
            device_id: Some(device.into()),
            reading_type: Some("temp".into()),
            ..Default::default()
        };
        PersistedRow::build(
            &reading,
            envelope,
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            21.5,
        )
    }

    #[tokio::test]
    async fn test_sqlite_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("readings.db"), "readings").unwrap();
        let env = SignedEnvelope {
            signature: vec![0xab; 64],
            ingester_id: "wsi_1".into(),
            key_version: 1,
        };

        sink.write_batch(&[row("a", Some(&env)), row("b", None)])
            .await
            .unwrap();

        assert_eq!(sink.count_rows().unwrap(), 2);
        let signatures = sink.signatures().unwrap();
        assert_eq!(hex::decode(&signatures[0]).unwrap(), env.signature);
        assert_eq!(signatures[1], "");
    }

    #[tokio::test]
    async fn test_sqlite_sink_rejects_writes_after_close() {
        let sink = SqliteSink::open_in_memory("readings").unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(matches!(
            sink.write_batch(&[row("a", None)]).await,
            Err(SinkError::Closed)
        ));
    }

    #[test]
    fn test_sqlite_sink_rejects_bad_table_name() {
        assert!(matches!(
            SqliteSink::open_in_memory("readings; DROP TABLE x"),
            Err(SinkError::InvalidTable(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_sink_injected_failures() {
        let sink = MemorySink::new();
        sink.fail_next(2);
        assert!(sink.write_batch(&[row("a", None)]).await.is_err());
        assert!(sink.write_batch(&[row("a", None)]).await.is_err());
        assert!(sink.write_batch(&[row("a", None)]).await.is_ok());
        assert_eq!(sink.attempt_count(), 3);
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(sink.rows().len(), 1);
    }
}
