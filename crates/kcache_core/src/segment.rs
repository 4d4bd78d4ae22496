//! Cache segments.
//!
//! A segment bundles the files that share one base offset:
//!
//! ```text
//! {base:019}.log     entries
//! {base:019}.delta   JSON patch bodies
//! {base:019}.index   offset delta -> log position
//! {base:019}.hscan   key/header hash -> log position (appendable)
//! {base:019}.hindex  same, sorted by hash (frozen)
//! {base:019}.kscan   key hash presence (appendable)
//! {base:019}.kindex  same, unique per hash (frozen)
//! {base:019}.nscan   tombstone timestamp delta -> log position (appendable)
//! {base:019}.nindex  same, unique per timestamp delta (frozen)
//! ```
//!
//! Segments are reference counted. The owning partition node holds one
//! reference from creation until it closes the segment; cursors take more
//! with [`Segment::acquire`] and give them back by dropping the returned
//! [`SegmentRef`]. Once the count reaches zero no further reference can be
//! acquired.

use crate::config::TopicConfig;
use crate::entry::{for_each_entry, CacheEntry, FIELD_OFFSET_DESCENDANT, FIELD_OFFSET_FLAGS};
use crate::error::{CacheError, CacheResult};
use crate::types::EntryFlags;
use kcache_storage::{index_key, IndexFile, SegmentFile, SortOrder, SortSpace};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension of the log file.
pub const EXT_LOG: &str = "log";
/// Extension of the delta file.
pub const EXT_DELTA: &str = "delta";
/// Extension of the offset index file.
pub const EXT_INDEX: &str = "index";
/// Extension of the unsorted hash file.
pub const EXT_HASH_SCAN: &str = "hscan";
/// Extension of the sorted hash file.
pub const EXT_HASH_INDEX: &str = "hindex";
/// Extension of the unsorted keys file.
pub const EXT_KEYS_SCAN: &str = "kscan";
/// Extension of the sorted keys file.
pub const EXT_KEYS_INDEX: &str = "kindex";
/// Extension of the unsorted nulls file.
pub const EXT_NULLS_SCAN: &str = "nscan";
/// Extension of the sorted nulls file.
pub const EXT_NULLS_INDEX: &str = "nindex";

/// `dirty_since` value while no entry is dirty.
pub const NO_DIRTY_SINCE: i64 = -1;

/// Returns the path of a segment file.
#[must_use]
pub fn segment_path(location: &Path, base_offset: i64, extension: &str) -> PathBuf {
    location.join(format!("{base_offset:019}.{extension}"))
}

fn work_path(location: &Path, base_offset: i64, extension: &str) -> PathBuf {
    location.join(format!("{base_offset:019}.{extension}.work"))
}

/// A segment found in a partition directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSegment {
    /// Base offset parsed from the log file name.
    pub base_offset: i64,
    /// Whether every sorted index exists next to the log.
    pub frozen: bool,
}

/// Lists the segments in `location` in base offset order.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn stored_segments(location: &Path) -> CacheResult<Vec<StoredSegment>> {
    let mut bases = Vec::new();
    for entry in std::fs::read_dir(location)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXT_LOG) {
            continue;
        }
        if let Some(base) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            bases.push(base);
        }
    }
    bases.sort_unstable();

    Ok(bases
        .into_iter()
        .map(|base_offset| StoredSegment {
            base_offset,
            frozen: [EXT_DELTA, EXT_INDEX, EXT_HASH_INDEX, EXT_KEYS_INDEX, EXT_NULLS_INDEX]
                .iter()
                .all(|extension| segment_path(location, base_offset, extension).exists()),
        })
        .collect())
}

/// Returns the current wall-clock time in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// One base-offset-aligned set of log, delta and index files.
pub struct Segment {
    location: PathBuf,
    topic: String,
    partition_id: i32,
    base_offset: i64,
    timestamp: i64,
    frozen: bool,

    log: SegmentFile,
    delta: SegmentFile,
    index: IndexFile,
    hash: IndexFile,
    keys: IndexFile,
    nulls: IndexFile,

    last_offset: AtomicI64,
    dirty_bytes: AtomicU64,
    dirty_since: AtomicI64,
    cleanable_at: AtomicI64,

    refs: AtomicI32,
    closed: AtomicBool,
}

impl Segment {
    /// Creates an appendable segment, replacing any files already at its
    /// paths.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be created.
    pub fn create(
        location: &Path,
        topic: &str,
        partition_id: i32,
        base_offset: i64,
        config: &TopicConfig,
    ) -> CacheResult<Arc<Self>> {
        Self::create_at(location, topic, partition_id, base_offset, now_millis(), config)
    }

    /// Creates an empty appendable segment over this segment's paths with
    /// the same timestamp. Compaction rewrites a segment into one of these
    /// after deleting its files.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be created.
    pub fn recreate(&self, config: &TopicConfig) -> CacheResult<Arc<Self>> {
        Self::create_at(
            &self.location,
            &self.topic,
            self.partition_id,
            self.base_offset,
            self.timestamp,
            config,
        )
    }

    fn create_at(
        location: &Path,
        topic: &str,
        partition_id: i32,
        base_offset: i64,
        timestamp: i64,
        config: &TopicConfig,
    ) -> CacheResult<Arc<Self>> {
        std::fs::create_dir_all(location)?;
        let path = |extension: &str| segment_path(location, base_offset, extension);
        let index_bytes = config.segment_index_bytes;

        let segment = Self {
            location: location.to_path_buf(),
            topic: topic.to_string(),
            partition_id,
            base_offset,
            timestamp,
            frozen: false,
            log: SegmentFile::create(&path(EXT_LOG), config.segment_bytes)?,
            delta: SegmentFile::create(&path(EXT_DELTA), config.segment_bytes)?,
            index: IndexFile::create(&path(EXT_INDEX), index_bytes, SortOrder::ByKey)?,
            hash: IndexFile::create(&path(EXT_HASH_SCAN), index_bytes, SortOrder::ByValue)?,
            keys: IndexFile::create(&path(EXT_KEYS_SCAN), index_bytes, SortOrder::ByValue)?,
            nulls: IndexFile::create(&path(EXT_NULLS_SCAN), index_bytes, SortOrder::ByValue)?,
            last_offset: AtomicI64::new(base_offset - 1),
            dirty_bytes: AtomicU64::new(0),
            dirty_since: AtomicI64::new(NO_DIRTY_SINCE),
            cleanable_at: AtomicI64::new(i64::MAX),
            refs: AtomicI32::new(1),
            closed: AtomicBool::new(false),
        };

        tracing::debug!(segment = %segment, "created segment");
        Ok(Arc::new(segment))
    }

    /// Opens a frozen segment from disk.
    ///
    /// The last offset is recovered from the offset index and the dirty byte
    /// count from the entry flags, dirty since the log was last modified.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the frozen files is missing or invalid.
    pub fn open(
        location: &Path,
        topic: &str,
        partition_id: i32,
        base_offset: i64,
    ) -> CacheResult<Arc<Self>> {
        let path = |extension: &str| segment_path(location, base_offset, extension);
        let log_path = path(EXT_LOG);
        let timestamp = std::fs::metadata(&log_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or_else(now_millis, |d| {
                i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
            });

        let segment = Self::frozen(
            location,
            topic,
            partition_id,
            base_offset,
            timestamp,
            SegmentFile::open(&log_path)?,
            SegmentFile::open(&path(EXT_DELTA))?,
            IndexFile::open(&path(EXT_INDEX), SortOrder::ByKey)?,
            IndexFile::open(&path(EXT_HASH_INDEX), SortOrder::ByKey)?,
            IndexFile::open(&path(EXT_KEYS_INDEX), SortOrder::ByKey)?,
            IndexFile::open(&path(EXT_NULLS_INDEX), SortOrder::ByKey)?,
        );

        let entries = segment.index.entries();
        if entries > 0 {
            let last = segment
                .index
                .entry_at(entries - 1)
                .ok_or_else(|| CacheError::segment_corruption("unreadable offset index"))?;
            segment
                .last_offset
                .store(base_offset + i64::from(index_key(last)), Ordering::Release);
        }

        let dirty = segment.log.read_bytes(0, |bytes| {
            let mut dirty = 0u64;
            for_each_entry(bytes, |entry| {
                if entry.flags().is_dirty() {
                    dirty += entry.sizeof() as u64;
                }
                Ok(())
            })
            .map(|()| dirty)
        })?;
        if dirty > 0 {
            segment.dirty_bytes.store(dirty, Ordering::Release);
            segment.dirty_since.store(timestamp, Ordering::Release);
        }

        Ok(Arc::new(segment))
    }

    #[allow(clippy::too_many_arguments)]
    fn frozen(
        location: &Path,
        topic: &str,
        partition_id: i32,
        base_offset: i64,
        timestamp: i64,
        log: SegmentFile,
        delta: SegmentFile,
        index: IndexFile,
        hash: IndexFile,
        keys: IndexFile,
        nulls: IndexFile,
    ) -> Self {
        Self {
            location: location.to_path_buf(),
            topic: topic.to_string(),
            partition_id,
            base_offset,
            timestamp,
            frozen: true,
            log,
            delta,
            index,
            hash,
            keys,
            nulls,
            last_offset: AtomicI64::new(base_offset - 1),
            dirty_bytes: AtomicU64::new(0),
            dirty_since: AtomicI64::new(NO_DIRTY_SINCE),
            cleanable_at: AtomicI64::new(i64::MAX),
            refs: AtomicI32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Freezes every file, sorts the scan files into their indexes and
    /// returns a new frozen instance over the result.
    ///
    /// This instance stays readable for cursors that still hold it, and
    /// reports end of segment from then on. Dirty and cleanable bookkeeping
    /// carries over to the new instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be frozen, sorted or reopened, or if
    /// a scan file holds more records than `sort_space` allows.
    pub fn freeze(&self, sort_space: &mut SortSpace) -> CacheResult<Arc<Self>> {
        let location = &self.location;
        let base = self.base_offset;
        let path = |extension: &str| segment_path(location, base, extension);

        self.log.freeze()?;
        self.delta.freeze()?;
        self.index.file().freeze()?;
        self.hash.file().freeze()?;
        self.keys.file().freeze()?;
        self.nulls.file().freeze()?;

        let hash = if self.frozen {
            IndexFile::open(&path(EXT_HASH_INDEX), SortOrder::ByKey)?
        } else {
            self.hash.sort_by_key(
                &work_path(location, base, EXT_HASH_SCAN),
                &path(EXT_HASH_INDEX),
                sort_space,
            )?
        };
        let keys = if self.frozen {
            IndexFile::open(&path(EXT_KEYS_INDEX), SortOrder::ByKey)?
        } else {
            self.keys.sort_by_key_unique(
                &work_path(location, base, EXT_KEYS_SCAN),
                &path(EXT_KEYS_INDEX),
                sort_space,
            )?
        };
        let nulls = if self.frozen {
            IndexFile::open(&path(EXT_NULLS_INDEX), SortOrder::ByKey)?
        } else {
            self.nulls.sort_by_key_unique(
                &work_path(location, base, EXT_NULLS_SCAN),
                &path(EXT_NULLS_INDEX),
                sort_space,
            )?
        };

        let frozen = Self::frozen(
            location,
            &self.topic,
            self.partition_id,
            base,
            self.timestamp,
            SegmentFile::open(&path(EXT_LOG))?,
            SegmentFile::open(&path(EXT_DELTA))?,
            IndexFile::open(&path(EXT_INDEX), SortOrder::ByKey)?,
            hash,
            keys,
            nulls,
        );
        frozen.last_offset.store(self.last_offset(), Ordering::Release);
        frozen
            .dirty_bytes
            .store(self.dirty_bytes.load(Ordering::Acquire), Ordering::Release);
        frozen.dirty_since.store(self.dirty_since(), Ordering::Release);
        frozen.cleanable_at.store(self.cleanable_at(), Ordering::Release);

        tracing::debug!(segment = %frozen, last_offset = frozen.last_offset(), "froze segment");
        Ok(Arc::new(frozen))
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
    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// Returns the first offset this segment can hold.
    #[must_use]
    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Returns the creation time in milliseconds.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns `true` for instances created by [`freeze`](Self::freeze) or
    /// [`open`](Self::open).
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns the log file.
    #[must_use]
    pub fn log_file(&self) -> &SegmentFile {
        &self.log
    }

    /// Returns the delta file.
    #[must_use]
    pub fn delta_file(&self) -> &SegmentFile {
        &self.delta
    }

    /// Returns the offset index.
    #[must_use]
    pub fn index_file(&self) -> &IndexFile {
        &self.index
    }

    /// Returns the hash index: the scan file while appendable, the sorted
    /// index once frozen.
    #[must_use]
    pub fn hash_file(&self) -> &IndexFile {
        &self.hash
    }

    /// Returns the keys index.
    #[must_use]
    pub fn keys_file(&self) -> &IndexFile {
        &self.keys
    }

    /// Returns the nulls index.
    #[must_use]
    pub fn nulls_file(&self) -> &IndexFile {
        &self.nulls
    }

    /// Returns the last offset written, or `base_offset - 1` if empty.
    #[must_use]
    pub fn last_offset(&self) -> i64 {
        self.last_offset.load(Ordering::Acquire)
    }

    /// Records the last offset written.
    pub fn set_last_offset(&self, offset: i64) {
        self.last_offset.store(offset, Ordering::Release);
    }

    /// Returns the offset the next entry would take.
    #[must_use]
    pub fn next_offset(&self) -> i64 {
        self.last_offset() + 1
    }

    /// Adds to the dirty byte count and stamps `dirty_since` on the first
    /// dirty entry.
    pub fn mark_dirty_bytes(&self, bytes: u64) {
        self.dirty_bytes.fetch_add(bytes, Ordering::AcqRel);
        let _ = self.dirty_since.compare_exchange(
            NO_DIRTY_SINCE,
            now_millis(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Returns the dirty byte count.
    #[must_use]
    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes.load(Ordering::Acquire)
    }

    /// Returns when the first entry became dirty, or [`NO_DIRTY_SINCE`].
    #[must_use]
    pub fn dirty_since(&self) -> i64 {
        self.dirty_since.load(Ordering::Acquire)
    }

    /// Returns dirty bytes over log bytes.
    #[must_use]
    pub fn cleanable_dirty_ratio(&self) -> f64 {
        let capacity = self.log.capacity();
        if capacity == 0 {
            0.0
        } else {
            self.dirty_bytes() as f64 / f64::from(capacity)
        }
    }

    /// ORs `flags` into the flags of the entry at `position` and returns the
    /// flags it had before.
    ///
    /// # Errors
    ///
    /// Returns an error if no entry header has been written at `position`.
    pub fn mark_flags(&self, position: u32, flags: EntryFlags) -> CacheResult<EntryFlags> {
        let at = position.saturating_add(FIELD_OFFSET_FLAGS as u32);
        let previous = self.log.read_int(at).map(EntryFlags).ok_or_else(|| {
            CacheError::segment_corruption(format!("no entry at position {position} of {self}"))
        })?;
        self.log.write_int(at, previous.union(flags).0)?;
        Ok(previous)
    }

    /// Flags `entry` dirty and counts its bytes, once.
    ///
    /// # Errors
    ///
    /// See [`mark_flags`](Self::mark_flags).
    pub fn mark_dirty(&self, entry: &CacheEntry<'_>) -> CacheResult<()> {
        let previous = self.mark_flags(entry.position(), EntryFlags::DIRTY)?;
        if !previous.is_dirty() {
            self.mark_dirty_bytes(entry.sizeof() as u64);
        }
        Ok(())
    }

    /// Records the offset that supersedes `entry`, then flags it dirty.
    ///
    /// # Errors
    ///
    /// See [`mark_flags`](Self::mark_flags).
    pub fn mark_descendant_and_dirty(&self, entry: &CacheEntry<'_>, descendant: i64) -> CacheResult<()> {
        self.log.write_long(
            entry.position().saturating_add(FIELD_OFFSET_DESCENDANT as u32),
            descendant,
        )?;
        self.mark_dirty(entry)
    }

    /// Returns the memoized compaction time, `i64::MAX` if not yet computed.
    #[must_use]
    pub fn cleanable_at(&self) -> i64 {
        self.cleanable_at.load(Ordering::Acquire)
    }

    /// Sets the compaction time.
    pub fn set_cleanable_at(&self, at: i64) {
        self.cleanable_at.store(at, Ordering::Release);
    }

    /// Takes a reference, or returns `None` once the segment has closed.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> Option<SegmentRef> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SegmentRef {
                        segment: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the current reference count.
    #[must_use]
    pub fn references(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Gives back the owner's reference. Later calls do nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!(segment = %self, "segment closed");
        }
    }

    /// Removes every file of this segment from disk. Mapped files stay
    /// readable until the last reference is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub fn delete(&self) -> CacheResult<()> {
        self.log.delete()?;
        self.delta.delete()?;
        self.index.file().delete()?;
        self.hash.file().delete()?;
        self.keys.file().delete()?;
        self.nulls.file().delete()?;
        for extension in [EXT_HASH_INDEX, EXT_KEYS_INDEX, EXT_NULLS_INDEX] {
            let path = segment_path(&self.location, self.base_offset, extension);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Segment] {}[{}] @ {} +{}",
            self.topic,
            self.partition_id,
            self.base_offset,
            self.references()
        )
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("topic", &self.topic)
            .field("partition_id", &self.partition_id)
            .field("base_offset", &self.base_offset)
            .field("frozen", &self.frozen)
            .field("last_offset", &self.last_offset())
            .field("refs", &self.references())
            .finish_non_exhaustive()
    }
}

/// A live reference to a segment, released on drop.
#[derive(Debug)]
pub struct SegmentRef {
    segment: Arc<Segment>,
}

impl SegmentRef {
    /// Returns the shared segment handle.
    #[must_use]
    pub fn arc(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Deref for SegmentRef {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        self.segment.release();
    }
}
