//! Index files mapping a 32-bit key to a 32-bit log position.
//!
//! Every record is a big-endian `u64` packing `key << 32 | value`. Keys and
//! values compare unsigned.
//!
//! - [`SortOrder::ByValue`] files are appended in arrival order. Because log
//!   positions only grow, they are sorted by value but not by key, so lookups
//!   are linear scans. Hash, keys and nulls scan files live here while their
//!   segment is appendable.
//! - [`SortOrder::ByKey`] files are sorted by key, then by value, and support
//!   binary search. The offset index is naturally in this order; scan files
//!   are converted at freeze time by [`IndexFile::sort_by_key`].
//!
//! Lookups return an [`IndexCursor`]. A miss is reported through the cursor
//! value: [`RETRY_SEGMENT_VALUE`] while the file can still grow,
//! [`NEXT_SEGMENT_VALUE`] once it is frozen.

use crate::error::{StorageError, StorageResult};
use crate::file::{remove_if_exists, SegmentFile};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Size in bytes of one index record.
pub const SIZEOF_INDEX_RECORD: u32 = 8;

/// Cursor value meaning "no match yet, retry this segment later".
pub const RETRY_SEGMENT_VALUE: i32 = -1;

/// Cursor value meaning "no match in this segment, move to the next".
pub const NEXT_SEGMENT_VALUE: i32 = i32::MAX - 1;

/// Packs a key and value into an index record.
#[must_use]
pub const fn index_entry(key: u32, value: u32) -> u64 {
    ((key as u64) << 32) | value as u64
}

/// Extracts the key of an index record.
#[must_use]
pub const fn index_key(entry: u64) -> u32 {
    (entry >> 32) as u32
}

/// Extracts the value of an index record.
#[must_use]
pub const fn index_value(entry: u64) -> u32 {
    entry as u32
}

/// Result of an index lookup: the record index and its value, or a sentinel
/// value on a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCursor {
    /// Record index the lookup stopped at.
    pub index: i32,
    /// Record value, or one of the sentinel values.
    pub value: i32,
}

impl IndexCursor {
    /// Creates a cursor.
    #[must_use]
    pub const fn new(index: i32, value: i32) -> Self {
        Self { index, value }
    }

    /// Returns `true` if the value is [`RETRY_SEGMENT_VALUE`].
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        self.value == RETRY_SEGMENT_VALUE
    }

    /// Returns `true` if the value is [`NEXT_SEGMENT_VALUE`].
    #[must_use]
    pub const fn is_next_segment(&self) -> bool {
        self.value == NEXT_SEGMENT_VALUE
    }

    /// Returns `true` if the value is either sentinel.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        self.is_retry() || self.is_next_segment()
    }
}

/// Ordering of the records in an [`IndexFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Sorted by key, then value.
    ByKey,
    /// Arrival order, sorted by value only.
    ByValue,
}

/// Reusable workspace for freeze-time sorts, bounded to a number of records.
#[derive(Debug)]
pub struct SortSpace {
    entries: Vec<u64>,
    limit: usize,
}

impl SortSpace {
    /// Creates a workspace that sorts at most `limit` records at once.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit,
        }
    }

    /// Returns the record limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn load(&mut self, file: &SegmentFile) -> StorageResult<&mut Vec<u64>> {
        let limit = self.limit;
        let entries = &mut self.entries;
        file.read_bytes(0, |bytes| {
            let required = bytes.len() / SIZEOF_INDEX_RECORD as usize;
            if required > limit {
                return Err(StorageError::SortSpaceExhausted { required, limit });
            }
            entries.clear();
            entries.reserve(required);
            for chunk in bytes.chunks_exact(SIZEOF_INDEX_RECORD as usize) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                entries.push(u64::from_be_bytes(raw));
            }
            Ok(())
        })?;
        Ok(&mut self.entries)
    }
}

/// An index file over a [`SegmentFile`].
#[derive(Debug)]
pub struct IndexFile {
    file: SegmentFile,
    order: SortOrder,
}

impl IndexFile {
    /// Creates a new appendable index file.
    ///
    /// # Errors
    ///
    /// See [`SegmentFile::create`].
    pub fn create(path: &Path, max_capacity: u32, order: SortOrder) -> StorageResult<Self> {
        Ok(Self {
            file: SegmentFile::create(path, max_capacity)?,
            order,
        })
    }

    /// Opens an existing, frozen index file.
    ///
    /// # Errors
    ///
    /// See [`SegmentFile::open`]. Also fails if the length is not a whole
    /// number of records.
    pub fn open(path: &Path, order: SortOrder) -> StorageResult<Self> {
        let file = SegmentFile::open(path)?;
        if file.capacity() % SIZEOF_INDEX_RECORD != 0 {
            return Err(StorageError::Corrupted(format!(
                "{} has a partial index record",
                path.display()
            )));
        }
        Ok(Self { file, order })
    }

    /// Returns the underlying segment file.
    #[must_use]
    pub fn file(&self) -> &SegmentFile {
        &self.file
    }

    /// Returns the record ordering.
    #[must_use]
    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Returns the number of records written.
    #[must_use]
    pub fn entries(&self) -> u32 {
        self.file.capacity() / SIZEOF_INDEX_RECORD
    }

    /// Returns the number of bytes that can still be appended.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.file.available()
    }

    /// Appends a record. Returns `false` if the file is full.
    pub fn append_entry(&self, key: u32, value: u32) -> bool {
        self.file.append_long(index_entry(key, value) as i64)
    }

    /// Returns the record at `index`.
    #[must_use]
    pub fn entry_at(&self, index: u32) -> Option<u64> {
        self.file
            .read_long(index.checked_mul(SIZEOF_INDEX_RECORD)?)
            .map(|v| v as u64)
    }

    /// Copies every record out of the file.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u64> {
        self.with_records(|records| (0..records.len()).map(|i| records.get(i)).collect())
    }

    fn with_records<T>(&self, visitor: impl FnOnce(Records<'_>) -> T) -> T {
        self.file.read_bytes(0, |bytes| visitor(Records(bytes)))
    }

    fn miss(&self, entries: usize) -> IndexCursor {
        let value = if self.file.available() != 0 {
            RETRY_SEGMENT_VALUE
        } else {
            NEXT_SEGMENT_VALUE
        };
        IndexCursor::new(to_index(entries), value)
    }

    /// Finds the first record with `key`.
    #[must_use]
    pub fn first(&self, key: u32) -> IndexCursor {
        self.with_records(|records| {
            let found = match self.order {
                SortOrder::ByKey => {
                    let index = records.lower_bound(key);
                    (index < records.len() && index_key(records.get(index)) == key)
                        .then_some(index)
                }
                SortOrder::ByValue => {
                    (0..records.len()).find(|&i| index_key(records.get(i)) == key)
                }
            };
            match found {
                Some(index) => records.cursor(index),
                None => self.miss(records.len()),
            }
        })
    }

    /// Finds the last record with `key`.
    #[must_use]
    pub fn last(&self, key: u32) -> IndexCursor {
        self.with_records(|records| {
            let found = match self.order {
                SortOrder::ByKey => records
                    .upper_bound(key)
                    .checked_sub(1)
                    .filter(|&i| index_key(records.get(i)) == key),
                SortOrder::ByValue => (0..records.len())
                    .rev()
                    .find(|&i| index_key(records.get(i)) == key),
            };
            match found {
                Some(index) => records.cursor(index),
                None => backward_miss(),
            }
        })
    }

    /// Finds a starting record for `key`.
    ///
    /// For key-sorted files this is the first record of the greatest key not
    /// above `key`, or the first record if every key is above it. For
    /// value-sorted files it is the first record of the smallest key not
    /// below `key`.
    #[must_use]
    pub fn floor(&self, key: u32) -> IndexCursor {
        self.with_records(|records| {
            if records.len() == 0 {
                return self.miss(0);
            }
            match self.order {
                SortOrder::ByKey => {
                    let index = match records.upper_bound(key).checked_sub(1) {
                        Some(last) => records.lower_bound(index_key(records.get(last))),
                        None => 0,
                    };
                    records.cursor(index)
                }
                SortOrder::ByValue => {
                    let mut floor: Option<(usize, u32)> = None;
                    for i in 0..records.len() {
                        let candidate = index_key(records.get(i));
                        if candidate >= key && floor.map_or(true, |(_, k)| candidate < k) {
                            floor = Some((i, candidate));
                            if candidate == key {
                                break;
                            }
                        }
                    }
                    match floor {
                        Some((index, _)) => records.cursor(index),
                        None => self.miss(records.len()),
                    }
                }
            }
        })
    }

    /// Scans forward from `cursor.index` for the first record whose value is
    /// at least `cursor.value`, ignoring keys.
    #[must_use]
    pub fn resolve(&self, cursor: IndexCursor) -> IndexCursor {
        let target = cursor.value.max(0) as u32;
        self.with_records(|records| {
            (start_of(cursor)..records.len())
                .find(|&i| index_value(records.get(i)) >= target)
                .map_or_else(|| self.miss(records.len()), |i| records.cursor(i))
        })
    }

    /// Scans forward for a record with `key` and a value at least
    /// `cursor.value`. A retry cursor matches any value.
    #[must_use]
    pub fn ceiling(&self, key: u32, cursor: IndexCursor) -> IndexCursor {
        self.scan_forward(key, cursor, |value, target| value >= target)
    }

    /// Scans forward for a record with `key` and a value above
    /// `cursor.value`. A retry cursor matches any value.
    #[must_use]
    pub fn higher(&self, key: u32, cursor: IndexCursor) -> IndexCursor {
        self.scan_forward(key, cursor, |value, target| value > target)
    }

    /// Scans backward for a record with `key` and a value at most
    /// `cursor.value`. A retry cursor matches any value.
    #[must_use]
    pub fn floor_at(&self, key: u32, cursor: IndexCursor) -> IndexCursor {
        self.scan_backward(key, cursor, |value, target| value <= target)
    }

    /// Scans backward for a record with `key` and a value below
    /// `cursor.value`. A retry cursor matches any value.
    #[must_use]
    pub fn lower(&self, key: u32, cursor: IndexCursor) -> IndexCursor {
        self.scan_backward(key, cursor, |value, target| value < target)
    }

    fn scan_forward(
        &self,
        key: u32,
        cursor: IndexCursor,
        accept: impl Fn(u32, u32) -> bool,
    ) -> IndexCursor {
        let any = cursor.is_retry();
        let target = cursor.value as u32;
        self.with_records(|records| {
            let mut start = start_of(cursor);
            if self.order == SortOrder::ByKey {
                start = start.max(records.lower_bound(key));
            }
            for i in start..records.len() {
                let entry = records.get(i);
                let candidate = index_key(entry);
                if candidate == key && (any || accept(index_value(entry), target)) {
                    return records.cursor(i);
                }
                if self.order == SortOrder::ByKey && candidate > key {
                    break;
                }
            }
            self.miss(records.len())
        })
    }

    fn scan_backward(
        &self,
        key: u32,
        cursor: IndexCursor,
        accept: impl Fn(u32, u32) -> bool,
    ) -> IndexCursor {
        let any = cursor.is_retry();
        let target = cursor.value as u32;
        self.with_records(|records| {
            if cursor.index < 0 || records.len() == 0 {
                return backward_miss();
            }
            let start = (cursor.index as usize).min(records.len() - 1);
            for i in (0..=start).rev() {
                let entry = records.get(i);
                let candidate = index_key(entry);
                if candidate == key && (any || accept(index_value(entry), target)) {
                    return records.cursor(i);
                }
                if self.order == SortOrder::ByKey && candidate < key {
                    break;
                }
            }
            backward_miss()
        })
    }

    /// Sorts this value-ordered file into a new key-ordered file at
    /// `sorted`, then deletes this file.
    ///
    /// The records are written to `work` first and renamed into place, so a
    /// crash never leaves a partially written index under `sorted`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SortSpaceExhausted`] if the file holds more
    /// records than `space` allows, or an I/O error.
    pub fn sort_by_key(
        &self,
        work: &Path,
        sorted: &Path,
        space: &mut SortSpace,
    ) -> StorageResult<IndexFile> {
        self.sort_into(work, sorted, space, false)
    }

    /// Like [`sort_by_key`](Self::sort_by_key), keeping only the record with
    /// the greatest value for each key.
    ///
    /// # Errors
    ///
    /// See [`sort_by_key`](Self::sort_by_key).
    pub fn sort_by_key_unique(
        &self,
        work: &Path,
        sorted: &Path,
        space: &mut SortSpace,
    ) -> StorageResult<IndexFile> {
        self.sort_into(work, sorted, space, true)
    }

    fn sort_into(
        &self,
        work: &Path,
        sorted: &Path,
        space: &mut SortSpace,
        unique: bool,
    ) -> StorageResult<IndexFile> {
        let entries = space.load(&self.file)?;

        entries.sort_unstable();
        if unique {
            // sorted ascending, so the last record of each key run has the greatest value
            entries.reverse();
            entries.dedup_by_key(|entry| index_key(*entry));
            entries.reverse();
        }

        {
            let mut writer = BufWriter::new(File::create(work)?);
            for entry in entries.iter() {
                writer.write_all(&entry.to_be_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(work, sorted)?;
        self.file.delete()?;
        remove_if_exists(work)?;

        tracing::debug!(
            from = %self.file.path().display(),
            to = %sorted.display(),
            records = entries.len(),
            unique,
            "sorted index file"
        );

        IndexFile::open(sorted, SortOrder::ByKey)
    }
}

struct Records<'a>(&'a [u8]);

impl Records<'_> {
    fn len(&self) -> usize {
        self.0.len() / SIZEOF_INDEX_RECORD as usize
    }

    fn get(&self, index: usize) -> u64 {
        let at = index * SIZEOF_INDEX_RECORD as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[at..at + 8]);
        u64::from_be_bytes(raw)
    }

    fn cursor(&self, index: usize) -> IndexCursor {
        IndexCursor::new(to_index(index), index_value(self.get(index)) as i32)
    }

    /// First index whose key is not below `key`.
    fn lower_bound(&self, key: u32) -> usize {
        let (mut low, mut high) = (0, self.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if index_key(self.get(mid)) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// First index whose key is above `key`.
    fn upper_bound(&self, key: u32) -> usize {
        let (mut low, mut high) = (0, self.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if index_key(self.get(mid)) <= key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }
}

fn to_index(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

fn start_of(cursor: IndexCursor) -> usize {
    cursor.index.max(0) as usize
}

const fn backward_miss() -> IndexCursor {
    IndexCursor::new(-1, NEXT_SEGMENT_VALUE)
}
