//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Every variant other than [`StorageError::SortSpaceExhausted`] means the
/// mapped file can no longer be trusted; callers treat them as fatal for the
/// owning segment.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to overwrite bytes that were never appended.
    #[error("write beyond capacity: position {position}, len {len}, capacity {capacity}")]
    WritePastEnd {
        /// The requested write position.
        position: u32,
        /// The requested write length.
        len: usize,
        /// The current file capacity.
        capacity: u32,
    },

    /// The file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A sort needed more workspace than the configured budget.
    #[error("sort space exhausted: {required} entries required, limit {limit}")]
    SortSpaceExhausted {
        /// Number of index records to sort.
        required: usize,
        /// Configured workspace limit in records.
        limit: usize,
    },

    /// An append was attempted on a frozen file.
    #[error("file is frozen: {}", path.display())]
    Frozen {
        /// Path of the frozen file.
        path: PathBuf,
    },
}
