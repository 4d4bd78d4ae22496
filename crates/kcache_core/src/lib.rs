//! # kcache core
//!
//! A segmented, memory-mapped cache of Kafka topic partitions.
//!
//! This crate provides:
//! - [`Partition`] - the ordered segments of one partition, their write
//!   paths, compaction and retention policy
//! - [`Segment`] - one reference-counted segment: log, delta and index files
//! - [`CursorFactory`] and [`Cursor`] - filtered, delta-aware reads that
//!   narrow candidates through the hash and offset indexes
//! - [`entry`] - the on-disk entry layout and its views
//! - [`delta`] - JSON patches between successive values of a key
//!
//! ## Example
//!
//! ```rust
//! use kcache_core::{
//!     ConditionSpec, CursorFactory, DeltaType, Evaluation, Filter, Partition, Record, TopicConfig,
//! };
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = TopicConfig::new().segment_bytes(64 * 1024).segment_index_bytes(16 * 1024);
//! let mut partition = Partition::new(dir.path(), "orders", 0, config).unwrap();
//! partition.append(0).unwrap();
//! partition
//!     .write_entry(&Record::new(0, Some(b"a"), Some(b"1")), None, DeltaType::None)
//!     .unwrap();
//! partition
//!     .write_entry(&Record::new(1, Some(b"b"), Some(b"2")), None, DeltaType::None)
//!     .unwrap();
//!
//! let factory = CursorFactory::new();
//! let filters = [Filter::of(ConditionSpec::key(Some(b"b")))];
//! let condition = factory.as_condition(&filters, Evaluation::Lazy).unwrap();
//! let mut cursor = factory.new_cursor(condition, DeltaType::None);
//! cursor.init(partition.nodes(), partition.first(), 0, 1);
//!
//! let entry = cursor.next(partition.nodes()).unwrap();
//! assert_eq!(entry.entry().offset(), 1);
//! ```
//!
//! ## Key Invariants
//!
//! - One writer per partition; cursors read concurrently
//! - Only the last segment of a partition is appendable
//! - Offsets strictly increase across a partition

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
pub mod delta;
pub mod entry;
mod error;
mod filter;
mod node;
mod partition;
mod segment;
mod types;
mod validator;

pub use config::{CleanupPolicy, TopicConfig};
pub use cursor::Cursor;
pub use entry::{CacheEntry, EntryBuf, Header, HeaderRef};
pub use error::{CacheError, CacheResult};
pub use filter::{
    is_sentinel, Condition, ConditionSpec, CursorFactory, Equals, Filter, HeaderSequence,
    NotCondition, OffsetWalk, Skip, ValueMatch, MAX_FILTER_GROUPS,
};
pub use node::{NodeDescription, NodeId, NodeList, PartitionNodes};
pub use partition::{
    fetch_dir, produce_dir, CleanResult, Partition, ProduceEntry, ProduceMark, Record,
    NO_ACKNOWLEDGE,
};
pub use segment::{now_millis, segment_path, stored_segments, Segment, SegmentRef, StoredSegment};
pub use types::{AckMode, DeltaType, EntryFlags, Evaluation, OFFSET_HISTORICAL, OFFSET_LIVE};
pub use validator::{JsonValidator, ValueValidator};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
