//! # kcache storage
//!
//! Memory-mapped files backing the kcache partition cache.
//!
//! This crate knows nothing about cache entries. It provides:
//!
//! - [`SegmentFile`] - a fixed-size, append-only mapped file that can be
//!   patched in place and frozen to its written length
//! - [`IndexFile`] - packed `key << 32 | value` records, either in arrival
//!   order or sorted by key, with the lookups the cursor needs
//! - [`SortSpace`] - the bounded workspace used to sort scan files when a
//!   segment freezes
//!
//! ## Example
//!
//! ```rust
//! use kcache_storage::{IndexFile, SortOrder};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let index = IndexFile::create(&dir.path().join("0.index"), 64, SortOrder::ByKey).unwrap();
//! index.append_entry(0, 0);
//! index.append_entry(1, 96);
//!
//! let cursor = index.first(1);
//! assert_eq!(cursor.value, 96);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod index;

pub use error::{StorageError, StorageResult};
pub use file::SegmentFile;
pub use index::{
    index_entry, index_key, index_value, IndexCursor, IndexFile, SortOrder, SortSpace,
    NEXT_SEGMENT_VALUE, RETRY_SEGMENT_VALUE, SIZEOF_INDEX_RECORD,
};
