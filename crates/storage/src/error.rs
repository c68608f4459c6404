//! Storage error types

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite reported an error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Archive file or directory could not be prepared
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row is not in the expected shape
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// All write attempts failed
    #[error("Write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The blocking worker panicked or was cancelled
    #[error("Storage worker failed: {0}")]
    Worker(String),
}

impl StorageError {
    /// Contention and transient I/O failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Database(err) => matches!(
                err.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::DiskFull
                )
            ),
            StorageError::Io(_) => true,
            _ => false,
        }
    }
}
