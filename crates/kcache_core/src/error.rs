//! Error types for the partition cache.

use std::io;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur in cache operations.
///
/// "Not yet available" and "end of segment" are never errors; cursors report
/// them by returning `None`. Storage and corruption errors mean the on-disk
/// invariants no longer hold and the partition should be abandoned.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] kcache_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse or serialization error while computing a delta.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An entry was written at an offset not above the partition progress.
    #[error("offset {offset} is not above partition progress {progress}")]
    NonMonotonicOffset {
        /// Offset of the rejected entry.
        offset: i64,
        /// Last offset written to the partition.
        progress: i64,
    },

    /// A segment file ran out of room mid-entry.
    #[error("{file} file exhausted: {required} bytes required, {available} available")]
    CapacityExhausted {
        /// Which file of the segment ran out of room.
        file: &'static str,
        /// Bytes the write needed.
        required: usize,
        /// Bytes that were left.
        available: u32,
    },

    /// A write was attempted before any segment was appended.
    #[error("partition has no head segment")]
    NoHeadSegment,

    /// A continue or finish call arrived without a started entry.
    #[error("no entry write in progress")]
    NoPendingEntry,

    /// A filter cannot be compiled into a condition.
    #[error("invalid filter: {message}")]
    InvalidFilter {
        /// Description of the problem.
        message: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A JSON patch could not be applied.
    #[error("invalid patch: {message}")]
    InvalidPatch {
        /// Description of the problem.
        message: String,
    },

    /// Segment is corrupted or invalid.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },
}

impl CacheError {
    /// Creates a capacity exhausted error.
    pub fn capacity_exhausted(file: &'static str, required: usize, available: u32) -> Self {
        Self::CapacityExhausted {
            file,
            required,
            available,
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid filter error.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            message: message.into(),
        }
    }

    /// Creates an invalid patch error.
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch {
            message: message.into(),
        }
    }

    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CacheError::NonMonotonicOffset {
            offset: 4,
            progress: 7,
        };
        assert_eq!(err.to_string(), "offset 4 is not above partition progress 7");

        let err = CacheError::capacity_exhausted("log", 100, 12);
        assert_eq!(
            err.to_string(),
            "log file exhausted: 100 bytes required, 12 available"
        );
    }

    #[test]
    fn from_storage_error() {
        let storage = kcache_storage::StorageError::Corrupted("bad".into());
        let err: CacheError = storage.into();
        assert!(matches!(err, CacheError::Storage(_)));
    }
}
