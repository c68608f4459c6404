//! Persistence Layer for GreekStream
//!
//! Snapshots and health events are archived in a single embedded SQLite
//! file that allows one writer at a time.
//!
//! - [`archive`] - Short-connection writes and read-only history queries
//! - [`retry`] - Bounded retry with exponential backoff for writes
//! - [`writer`] - Background task that drains the archive queue in order
//!
//! Writes never block the pipeline: the ingestion loop enqueues records
//! through [`ArchiveHandle`] and the [`ArchiveWriter`] task commits them.

pub mod archive;
pub mod error;
pub mod retry;
pub mod writer;

pub use archive::{find_gaps, ArchiveStats, ArchiveStore, SequenceGap, SnapshotArchive};
pub use error::StorageError;
pub use retry::RetryPolicy;
pub use writer::{ArchiveHandle, ArchiveRecord, ArchiveWriter};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
