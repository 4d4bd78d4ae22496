//! Cache partitions.
//!
//! A partition owns the ordered list of its segments and is their single
//! writer:
//!
//! ```text
//! sentinel <-> [Node] 0 <-> [Node] 1000 <-> ... <-> [Node] 5000 <-> sentinel
//!              frozen       frozen                  head (appendable)
//! ```
//!
//! Writes go through [`Partition::write_entry`] or the three-call
//! start/continue/finish protocol, produce-path writes through
//! [`Partition::write_produce_entry_start`]. Compaction, retention policy and
//! dirty marking live in the `compact` submodule.
//!
//! ## Invariants
//!
//! - Only the last node is appendable; every other segment is frozen
//! - Offsets strictly increase across the partition (`progress`)
//! - Writers take `&mut self`; cursors read concurrently through
//!   [`PartitionNodes`]

mod compact;
mod produce;
mod write;

pub use compact::CleanResult;
pub use produce::{ProduceEntry, ProduceMark, NO_ACKNOWLEDGE};
pub use write::Record;

use crate::config::TopicConfig;
use crate::error::{CacheError, CacheResult};
use crate::node::{NodeId, PartitionNodes};
use crate::segment::{
    segment_path, stored_segments, Segment, EXT_DELTA, EXT_HASH_INDEX, EXT_HASH_SCAN, EXT_INDEX,
    EXT_KEYS_INDEX, EXT_KEYS_SCAN, EXT_LOG, EXT_NULLS_INDEX, EXT_NULLS_SCAN,
};
use crate::types::OFFSET_HISTORICAL;
use crate::validator::ValueValidator;
use kcache_storage::{IndexFile, SegmentFile, SortSpace};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Returns the directory name of a fetch partition.
#[must_use]
pub fn fetch_dir(topic: &str, id: i32) -> String {
    format!("{topic}-{id}")
}

/// Returns the directory name of a produce partition.
#[must_use]
pub fn produce_dir(topic: &str, id: i32, index: i32) -> String {
    format!("{topic}-{id}-{index}")
}

/// One cached topic partition.
pub struct Partition {
    location: PathBuf,
    topic: String,
    id: i32,
    config: TopicConfig,
    nodes: PartitionNodes,
    sort_space: SortSpace,
    progress: i64,
    produce_capacity: Arc<AtomicU64>,
    pending: Option<write::PendingEntry>,
    key_validator: Option<Box<dyn ValueValidator>>,
    value_validator: Option<Box<dyn ValueValidator>>,
}

impl Partition {
    /// Creates an empty fetch partition under `directory/{topic}-{id}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the directory
    /// cannot be created.
    pub fn new(directory: &Path, topic: &str, id: i32, config: TopicConfig) -> CacheResult<Self> {
        Self::at(
            directory.join(fetch_dir(topic, id)),
            topic,
            id,
            config,
            Arc::default(),
        )
    }

    /// Creates an empty produce partition under
    /// `directory/{topic}-{id}-{index}`. Every segment it appends adds
    /// `segment_bytes` to `produce_capacity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the directory
    /// cannot be created.
    pub fn new_produce(
        directory: &Path,
        topic: &str,
        id: i32,
        index: i32,
        config: TopicConfig,
        produce_capacity: Arc<AtomicU64>,
    ) -> CacheResult<Self> {
        Self::at(
            directory.join(produce_dir(topic, id, index)),
            topic,
            id,
            config,
            produce_capacity,
        )
    }

    /// Reopens the fetch partition under `directory/{topic}-{id}`.
    ///
    /// # Errors
    ///
    /// See [`open_dir`](Self::open_dir).
    pub fn open(directory: &Path, topic: &str, id: i32, config: TopicConfig) -> CacheResult<Self> {
        Self::open_dir(directory.join(fetch_dir(topic, id)), topic, id, config)
    }

    /// Reopens the partition stored in `location`.
    ///
    /// Frozen segments are reopened in base offset order. A segment without
    /// its sorted indexes was still appendable when the cache stopped; its
    /// files are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a frozen segment
    /// cannot be opened.
    pub fn open_dir(
        location: PathBuf,
        topic: &str,
        id: i32,
        config: TopicConfig,
    ) -> CacheResult<Self> {
        let mut partition = Self::at(location, topic, id, config, Arc::default())?;

        for stored in stored_segments(&partition.location)? {
            let base = stored.base_offset;
            if !stored.frozen {
                warn!(
                    partition = %partition,
                    base_offset = base,
                    "discarding unfrozen segment"
                );
                remove_segment_files(&partition.location, base)?;
                continue;
            }
            let segment = Segment::open(&partition.location, topic, id, base)?;
            partition.progress = partition.progress.max(segment.last_offset());
            partition.nodes.write(|list| list.push_back(segment));
        }

        debug!(
            partition = %partition,
            segments = partition.nodes.read(|list| list.len()),
            progress = partition.progress,
            "opened partition"
        );
        Ok(partition)
    }

    fn at(
        location: PathBuf,
        topic: &str,
        id: i32,
        config: TopicConfig,
        produce_capacity: Arc<AtomicU64>,
    ) -> CacheResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&location)?;
        Ok(Self {
            location,
            topic: topic.to_string(),
            id,
            sort_space: SortSpace::new(config.sort_space_limit()),
            config,
            nodes: PartitionNodes::new(),
            progress: OFFSET_HISTORICAL,
            produce_capacity,
            pending: None,
            key_validator: None,
            value_validator: None,
        })
    }

    /// Installs a validator for keys. Rejected entries are flagged ABORTED.
    #[must_use]
    pub fn with_key_validator(mut self, validator: impl ValueValidator + 'static) -> Self {
        self.key_validator = Some(Box::new(validator));
        self
    }

    /// Installs a validator for complete values. Rejected entries are
    /// flagged ABORTED.
    #[must_use]
    pub fn with_value_validator(mut self, validator: impl ValueValidator + 'static) -> Self {
        self.value_validator = Some(Box::new(validator));
        self
    }

    /// Returns the partition directory.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the partition id.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Returns the topic configuration.
    #[must_use]
    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    /// Returns a shareable handle to the node list, for cursors.
    #[must_use]
    pub fn nodes(&self) -> &PartitionNodes {
        &self.nodes
    }

    /// Returns the last offset written, or [`OFFSET_HISTORICAL`].
    #[must_use]
    pub fn progress(&self) -> i64 {
        self.progress
    }

    /// Returns the bytes reserved by produce segments so far.
    #[must_use]
    pub fn produce_capacity(&self) -> u64 {
        self.produce_capacity.load(Ordering::Acquire)
    }

    /// Returns the sentinel node.
    #[must_use]
    pub fn sentinel(&self) -> NodeId {
        self.nodes.read(|list| list.sentinel())
    }

    /// Returns the head node, or the sentinel if empty.
    #[must_use]
    pub fn head(&self) -> NodeId {
        self.nodes.read(|list| list.head())
    }

    /// Returns the first node, or the sentinel if empty.
    #[must_use]
    pub fn first(&self) -> NodeId {
        self.nodes.read(|list| list.first())
    }

    /// Returns the first node whose base offset is not below `offset`.
    #[must_use]
    pub fn seek_not_before(&self, offset: i64) -> NodeId {
        self.nodes.read(|list| list.seek_not_before(offset))
    }

    /// Returns the last node whose base offset is not above `offset`.
    #[must_use]
    pub fn seek_not_after(&self, offset: i64) -> NodeId {
        self.nodes.read(|list| list.seek_not_after(offset))
    }

    /// Returns the segment of `node`.
    #[must_use]
    pub fn segment(&self, node: NodeId) -> Option<Arc<Segment>> {
        self.nodes.read(|list| list.segment(node))
    }

    /// Returns the offset after the head segment's last entry, or
    /// `default` if the partition is empty.
    #[must_use]
    pub fn next_offset(&self, default: i64) -> i64 {
        self.segment(self.head())
            .map_or(default, |segment| segment.next_offset())
    }

    /// Appends a new head segment at `offset`, freezing the previous head.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NonMonotonicOffset`] if `offset` is below the
    /// partition progress or not above the head segment's base offset, or
    /// an error if a segment cannot be created or frozen.
    pub fn append(&mut self, offset: i64) -> CacheResult<NodeId> {
        let previous = self.head();
        let head_base = self.segment(previous).map(|segment| segment.base_offset());
        if offset < self.progress || head_base.is_some_and(|base| offset <= base) {
            return Err(CacheError::NonMonotonicOffset {
                offset,
                progress: head_base.map_or(self.progress, |base| self.progress.max(base)),
            });
        }

        if let Some(segment) = self.segment(previous).filter(|s| !s.is_frozen()) {
            let frozen = segment.freeze(&mut self.sort_space)?;
            if let Some(old) = self.nodes.write(|list| list.replace(previous, frozen)) {
                old.close();
            }
        }

        let segment = Segment::create(&self.location, &self.topic, self.id, offset, &self.config)?;
        let node = self.nodes.write(|list| list.push_back(segment));
        self.produce_capacity
            .fetch_add(u64::from(self.config.segment_bytes), Ordering::AcqRel);

        debug!(partition = %self, base_offset = offset, "appended segment");
        Ok(node)
    }

    /// Closes every segment. Cursors that still hold references keep reading
    /// until they drop them.
    pub fn close(&mut self) {
        self.pending = None;
        let segments = self.nodes.write(|list| {
            let ids: Vec<NodeId> = list.iter().map(|(id, _)| id).collect();
            ids.into_iter()
                .filter_map(|id| list.remove(id))
                .collect::<Vec<_>>()
        });
        for segment in segments {
            segment.close();
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cache] {}[{}]", self.topic, self.id)
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("location", &self.location)
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("progress", &self.progress)
            .field("segments", &self.nodes.read(|list| list.len()))
            .finish_non_exhaustive()
    }
}

fn remove_segment_files(location: &Path, base_offset: i64) -> CacheResult<()> {
    for extension in [
        EXT_LOG,
        EXT_DELTA,
        EXT_INDEX,
        EXT_HASH_SCAN,
        EXT_HASH_INDEX,
        EXT_KEYS_SCAN,
        EXT_KEYS_INDEX,
        EXT_NULLS_SCAN,
        EXT_NULLS_INDEX,
    ] {
        let path = segment_path(location, base_offset, extension);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn append_bytes(file: &SegmentFile, name: &'static str, bytes: &[u8]) -> CacheResult<()> {
    if file.append_bytes(bytes) {
        Ok(())
    } else {
        Err(CacheError::capacity_exhausted(name, bytes.len(), file.available()))
    }
}

fn append_index(file: &IndexFile, name: &'static str, key: u32, value: u32) -> CacheResult<()> {
    if file.append_entry(key, value) {
        Ok(())
    } else {
        Err(CacheError::capacity_exhausted(
            name,
            kcache_storage::SIZEOF_INDEX_RECORD as usize,
            file.available(),
        ))
    }
}
