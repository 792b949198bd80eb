//! Buffered, backpressure-aware writer in front of a [`RowSink`].
//!
//! Rows are appended to an in-memory buffer and flushed by a background task
//! when the buffer reaches `batch_size` or `flush_interval` has elapsed since
//! the last flush, whichever comes first. A failed batch is retried with
//! exponential backoff up to `max_attempts`; after that it is dropped and
//! counted in `rows_lost`.
//!
//! When the buffer holds `max_buffered_rows`, `append` waits for a flush
//! instead of growing without bound.

use meshward_core::PersistedRow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{WriterError, WriterResult};
use crate::sink::RowSink;

/// Flush thresholds and retry policy.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Rows per batch; reaching it triggers a flush
    pub batch_size: usize,
    /// Maximum time between flushes
    pub flush_interval: Duration,
    /// Write attempts per batch before it is dropped
    pub max_attempts: u32,
    /// Delay before the first retry; doubled each attempt
    pub retry_backoff: Duration,
    /// Upper bound on the retry delay
    pub max_backoff: Duration,
    /// Buffered rows at which `append` starts waiting
    pub max_buffered_rows: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_buffered_rows: 50_000,
        }
    }
}

/// Snapshot of writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Rows durably written
    pub total_written: u64,
    /// Rows waiting in the buffer
    pub buffer_size: usize,
    /// Batches dropped after exhausting retries
    pub failed_batches: u64,
    /// Rows in dropped batches
    pub rows_lost: u64,
}

struct Shared {
    config: WriterConfig,
    sink: Arc<dyn RowSink>,
    buffer: Mutex<Vec<PersistedRow>>,
    /// Set under the buffer lock so no row lands after the final flush
    closed: AtomicBool,
    flush_wanted: Notify,
    drained: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    total_written: AtomicU64,
    failed_batches: AtomicU64,
    rows_lost: AtomicU64,
}

impl Shared {
    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<PersistedRow>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain the buffer in batches. Returns rows handed to the sink.
    async fn flush(&self) -> usize {
        let _serialized = self.flush_lock.lock().await;
        let mut flushed = 0;

        loop {
            let batch: Vec<PersistedRow> = {
                let mut buffer = self.buffer();
                if buffer.is_empty() {
                    break;
                }
                let n = buffer.len().min(self.config.batch_size.max(1));
                buffer.drain(..n).collect()
            };

            flushed += batch.len();
            self.write_with_retry(&batch).await;
            self.drained.notify_waiters();
        }

        flushed
    }

    async fn write_with_retry(&self, batch: &[PersistedRow]) -> bool {
        let rows = batch.len() as u64;
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 1;

        loop {
            match self.sink.write_batch(batch).await {
                Ok(()) => {
                    self.total_written.fetch_add(rows, Ordering::Relaxed);
                    if attempt > 1 {
                        info!(rows, attempt, "batch written after retry");
                    } else {
                        debug!(rows, "batch written");
                    }
                    return true;
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        rows,
                        attempt,
                        max_attempts,
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %e,
                        "batch write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    self.failed_batches.fetch_add(1, Ordering::Relaxed);
                    self.rows_lost.fetch_add(rows, Ordering::Relaxed);
                    error!(
                        rows,
                        attempts = attempt,
                        error = %e,
                        "batch dropped after exhausting retries"
                    );
                    return false;
                }
            }
        }
    }
}

/// Buffers rows and persists them through a [`RowSink`] in batches.
pub struct BufferedWriter {
    shared: Arc<Shared>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedWriter {
    /// Start the writer and its background flush task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(sink: Arc<dyn RowSink>, config: WriterConfig) -> Self {
        info!(
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_attempts = config.max_attempts,
            max_buffered_rows = config.max_buffered_rows,
            "starting buffered writer"
        );

        let shared = Arc::new(Shared {
            config,
            sink,
            buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            flush_wanted: Notify::new(),
            drained: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            total_written: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            rows_lost: AtomicU64::new(0),
        });

        let token = CancellationToken::new();
        let task = tokio::spawn(flush_loop(Arc::clone(&shared), token.clone()));

        Self {
            shared,
            token,
            task: Mutex::new(Some(task)),
        }
    }

    /// Add a row to the buffer.
    ///
    /// Waits for a flush while the buffer is at `max_buffered_rows`.
    /// Fails with [`WriterError::Closed`] once `close` has begun.
    pub async fn append(&self, row: PersistedRow) -> WriterResult<()> {
        let cap = self.shared.config.max_buffered_rows.max(1);

        loop {
            let drained = self.shared.drained.notified();
            {
                let mut buffer = self.shared.buffer();
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(WriterError::Closed);
                }
                if buffer.len() < cap {
                    buffer.push(row);
                    if buffer.len() >= self.shared.config.batch_size {
                        self.shared.flush_wanted.notify_one();
                    }
                    return Ok(());
                }
            }

            debug!(cap, "writer buffer full, waiting for flush");
            self.shared.flush_wanted.notify_one();
            drained.await;
        }
    }

    /// Flush everything buffered now. Returns rows handed to the sink.
    pub async fn flush(&self) -> usize {
        self.shared.flush().await
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            total_written: self.shared.total_written.load(Ordering::Relaxed),
            buffer_size: self.shared.buffer().len(),
            failed_batches: self.shared.failed_batches.load(Ordering::Relaxed),
            rows_lost: self.shared.rows_lost.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Final flush, then release the sink. Later calls are no-ops.
    pub async fn close(&self) -> WriterResult<()> {
        {
            let _buffer = self.shared.buffer();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        self.token.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "flush task ended abnormally");
            }
        }

        let flushed = self.shared.flush().await;
        self.shared.drained.notify_waiters();
        self.shared.sink.close().await?;

        let stats = self.stats();
        info!(
            final_flush_rows = flushed,
            total_written = stats.total_written,
            rows_lost = stats.rows_lost,
            "buffered writer closed"
        );
        Ok(())
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn flush_loop(shared: Arc<Shared>, token: CancellationToken) {
    let interval = shared.config.flush_interval;
    let mut deadline = Instant::now() + interval;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = shared.flush_wanted.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }

        shared.flush().await;
        deadline = Instant::now() + interval;
    }

    debug!("flush loop stopped");
}
