//! Meshward Stream
//!
//! The write path between an accepted reading and durable storage:
//! flood-tolerant deduplication, the row sink abstraction, and the buffered
//! writer that batches rows into it.

pub mod dedup;
pub mod error;
pub mod sink;
pub mod writer;

pub use dedup::{DedupConfig, DedupStats, DeduplicationCache, DEFAULT_HORIZON, DEFAULT_MAX_ENTRIES};
pub use error::{SinkError, SinkResult, WriterError, WriterResult};
pub use sink::{MemorySink, RowSink, SqliteSink};
pub use writer::{BufferedWriter, WriterConfig, WriterStats};
