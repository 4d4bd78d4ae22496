//! Compaction, retention policy and dirty marking.
//!
//! Compaction rewrites a frozen segment without its DIRTY entries:
//!
//! ```text
//! old files deleted (still mapped)  ->  fresh appender at the same paths
//! copy every clean entry            ->  rebuild index, hash, keys and nulls
//! relocate delta records            ->  patch delta_position in the copy
//! freeze appender                   ->  swap into the node, or remove the
//!                                       node if nothing survived
//! ```
//!
//! ## Invariants
//!
//! - An appendable segment is never cleaned
//! - A cleaned segment holds no dirty entries and starts with zero dirty bytes
//! - Cursors holding the old segment keep reading it until they release it

use super::{append_bytes, append_index, Partition};
use crate::config::CleanupPolicy;
use crate::delta::read_delta_record;
use crate::entry::{
    compute_hash, encode_key, for_each_entry, CacheEntry, EntryBuf, FIELD_OFFSET_DELTA_POSITION,
    NO_DELTA_POSITION,
};
use crate::error::{CacheError, CacheResult};
use crate::node::NodeId;
use crate::segment::{Segment, NO_DIRTY_SINCE};
use crate::types::EntryFlags;
use kcache_storage::SegmentFile;
use serde::Serialize;
use tracing::{debug, info};

/// Result of cleaning one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanResult {
    /// Base offset of the cleaned segment.
    pub base_offset: i64,
    /// Entries in the segment before cleaning.
    pub input_entries: usize,
    /// Entries kept.
    pub output_entries: usize,
    /// Log bytes reclaimed.
    pub bytes_saved: u64,
    /// Whether the node was removed because nothing survived.
    pub node_removed: bool,
}

impl CleanResult {
    /// Returns the number of dirty entries dropped.
    #[must_use]
    pub fn dirty_removed(&self) -> usize {
        self.input_entries - self.output_entries
    }
}

impl Partition {
    /// Returns when `segment` is due to roll.
    #[must_use]
    pub fn retain_at(&self, segment: &Segment) -> i64 {
        segment.timestamp().saturating_add(self.config.segment_millis)
    }

    /// Returns when `segment` is due for deletion, with the retention window
    /// capped at `retention_max`.
    #[must_use]
    pub fn delete_at(&self, segment: &Segment, retention_max: i64) -> i64 {
        segment
            .timestamp()
            .saturating_add(self.config.retention_millis.min(retention_max))
    }

    /// Returns when `segment` becomes cleanable, or `i64::MAX` if it is not
    /// yet known.
    ///
    /// Once the dirty ratio reaches the configured minimum, the time is
    /// `dirty_since + min_compaction_lag`; below it, any dirt makes the
    /// segment cleanable at `dirty_since + max_compaction_lag` when that lag
    /// is bounded. Either is capped at `now` and memoized in the segment.
    #[must_use]
    pub fn compact_at(&self, segment: &Segment, now: i64) -> i64 {
        let mut cleanable_at = segment.cleanable_at();
        let dirty_since = segment.dirty_since();
        if cleanable_at != i64::MAX || dirty_since == NO_DIRTY_SINCE {
            return cleanable_at;
        }

        let ratio = segment.cleanable_dirty_ratio();
        if ratio >= self.config.min_cleanable_dirty_ratio {
            cleanable_at = dirty_since
                .saturating_add(self.config.min_compaction_lag_millis)
                .min(now);
        } else if ratio != 0.0 && self.config.max_compaction_lag_millis != i64::MAX {
            cleanable_at = dirty_since
                .saturating_add(self.config.max_compaction_lag_millis)
                .min(now);
        }

        if cleanable_at != i64::MAX {
            segment.set_cleanable_at(cleanable_at);
        }
        cleanable_at
    }

    /// Returns the cleanup policy.
    #[must_use]
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.config.cleanup_policy
    }

    /// Rewrites the segment of `node` without its dirty entries if it is
    /// cleanable at `now`.
    ///
    /// Returns `None` if the segment is still appendable, no longer exists,
    /// or is not yet cleanable.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be rewritten. The node's old
    /// files are gone by then, so the partition should be abandoned.
    pub fn clean(&mut self, node: NodeId, now: i64) -> CacheResult<Option<CleanResult>> {
        let Some(segment) = self.segment(node) else {
            return Ok(None);
        };
        if !segment.is_frozen() || segment.cleanable_at() > now {
            return Ok(None);
        }

        segment.delete()?;
        let appender = segment.recreate(&self.config)?;
        let mut result = CleanResult {
            base_offset: segment.base_offset(),
            ..CleanResult::default()
        };

        segment.log_file().read_bytes(0, |bytes| {
            for_each_entry(bytes, |entry| {
                result.input_entries += 1;
                if entry.flags().is_dirty() {
                    result.bytes_saved += entry.sizeof() as u64;
                    return Ok(());
                }
                copy_entry(&appender, entry, segment.delta_file())?;
                result.output_entries += 1;
                Ok(())
            })
        })?;

        let frozen = appender.freeze(&mut self.sort_space)?;
        appender.close();

        if frozen.log_file().is_empty() {
            frozen.delete()?;
            frozen.close();
            if let Some(old) = self.nodes.write(|list| list.remove(node)) {
                old.close();
            }
            result.node_removed = true;
            info!(
                partition = %self,
                base_offset = result.base_offset,
                dirty_removed = result.dirty_removed(),
                bytes_saved = result.bytes_saved,
                "compaction removed segment"
            );
        } else {
            if let Some(old) = self.nodes.write(|list| list.replace(node, frozen)) {
                old.close();
            }
            info!(
                partition = %self,
                base_offset = result.base_offset,
                kept = result.output_entries,
                dirty_removed = result.dirty_removed(),
                bytes_saved = result.bytes_saved,
                "compacted segment"
            );
        }
        Ok(Some(result))
    }

    /// Finds the most recent live entry with `key` in the segment of
    /// `node`, records `descendant` on it and flags it dirty.
    ///
    /// `hash` is the hash of the encoded key. Aborted and control entries
    /// are never ancestors, and a null key has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be patched.
    pub fn find_and_mark_ancestor(
        &self,
        node: NodeId,
        key: Option<&[u8]>,
        hash: u32,
        descendant: i64,
    ) -> CacheResult<Option<EntryBuf>> {
        if key.is_none() {
            return Ok(None);
        }
        let Some(segment) = self.segment(node) else {
            return Ok(None);
        };
        let encoded = encode_key(key);
        let hash_file = segment.hash_file();

        let mut cursor = hash_file.last(hash);
        while !cursor.is_sentinel() {
            let position = cursor.value as u32;
            let found = segment.log_file().read_bytes(position, |bytes| {
                CacheEntry::try_wrap(bytes, position)
                    .filter(|e| !e.flags().is_aborted() && !e.flags().is_control())
                    .filter(|e| e.key_bytes() == encoded.as_slice())
                    .map(|e| EntryBuf::copy_of(&e))
            });
            if let Some(ancestor) = found {
                segment.mark_descendant_and_dirty(&ancestor.entry(), descendant)?;
                return Ok(Some(ancestor));
            }
            cursor = hash_file.lower(hash, cursor);
        }
        Ok(None)
    }

    /// Marks the most recent live entry with `key` across the partition as
    /// superseded by `descendant`, searching the head first and then older
    /// segments whose keys index has seen the key. Entries with a null key
    /// are never superseded.
    ///
    /// # Errors
    ///
    /// See [`find_and_mark_ancestor`](Self::find_and_mark_ancestor).
    pub fn mark_ancestor(&self, key: Option<&[u8]>, descendant: i64) -> CacheResult<Option<EntryBuf>> {
        if key.is_none() {
            return Ok(None);
        }
        let hash = compute_hash(&encode_key(key));
        let head = self.head();
        if let Some(ancestor) = self.find_and_mark_ancestor(head, key, hash, descendant)? {
            return Ok(Some(ancestor));
        }

        let mut node = self.nodes.read(|list| list.previous(head));
        while let Some(current) = node.filter(|n| !n.is_sentinel()) {
            let seen = self
                .segment(current)
                .is_some_and(|segment| !segment.keys_file().last(hash).is_sentinel());
            if seen {
                if let Some(ancestor) = self.find_and_mark_ancestor(current, key, hash, descendant)? {
                    return Ok(Some(ancestor));
                }
            }
            node = self.nodes.read(|list| list.previous(current));
        }
        Ok(None)
    }

    /// Flags the entry at `offset` in the segment of `node` dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be patched.
    pub fn find_and_mark_dirty(&self, node: NodeId, offset: i64) -> CacheResult<Option<EntryBuf>> {
        let Some(segment) = self.segment(node) else {
            return Ok(None);
        };
        let Ok(delta) = u32::try_from(offset - segment.base_offset()) else {
            return Ok(None);
        };
        let cursor = segment.index_file().first(delta);
        if cursor.is_sentinel() {
            return Ok(None);
        }
        let position = cursor.value as u32;
        let found = segment.log_file().read_bytes(position, |bytes| {
            CacheEntry::try_wrap(bytes, position).map(|e| EntryBuf::copy_of(&e))
        });
        if let Some(entry) = &found {
            segment.mark_dirty(&entry.entry())?;
        }
        Ok(found)
    }

    /// Flags every non-control entry written by `producer_id` in the
    /// segment of `node` ABORTED. Returns how many entries were flagged.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unreadable or an entry cannot be
    /// patched.
    pub fn find_and_abort_producer_id(&self, node: NodeId, producer_id: i64) -> CacheResult<usize> {
        let Some(segment) = self.segment(node) else {
            return Ok(0);
        };
        let mut positions = Vec::new();
        segment.log_file().read_bytes(0, |bytes| {
            for_each_entry(bytes, |entry| {
                if entry.owner_id() == producer_id && !entry.flags().is_control() {
                    positions.push(entry.position());
                }
                Ok(())
            })
        })?;
        for position in &positions {
            segment.mark_flags(*position, EntryFlags::ABORTED)?;
        }
        debug!(
            segment = %segment,
            producer_id,
            aborted = positions.len(),
            "aborted producer entries"
        );
        Ok(positions.len())
    }
}

fn copy_entry(appender: &Segment, entry: &CacheEntry<'_>, deltas: &SegmentFile) -> CacheResult<()> {
    let log = appender.log_file();
    let at = log.capacity();
    let offset_delta = u32::try_from(entry.offset() - appender.base_offset()).map_err(|_| {
        CacheError::segment_corruption(format!("offset {} below base of {appender}", entry.offset()))
    })?;

    append_index(appender.index_file(), "index", offset_delta, at)?;
    let key_hash = compute_hash(entry.key_bytes());
    append_index(appender.hash_file(), "hash", key_hash, at)?;
    for header in entry.headers() {
        append_index(appender.hash_file(), "hash", compute_hash(header.encoded()), at)?;
    }
    if entry.is_tombstone() {
        let delta = entry.timestamp().saturating_sub(appender.timestamp()).max(0);
        let delta = u32::try_from(delta).unwrap_or(u32::MAX);
        append_index(appender.nulls_file(), "nulls", delta, at)?;
    }

    append_bytes(log, "log", entry.as_bytes())?;

    let delta_position = entry.delta_position();
    if delta_position != NO_DELTA_POSITION {
        let relocated = u32::try_from(delta_position)
            .ok()
            .and_then(|position| read_delta_record(deltas, position))
            .and_then(|record| {
                let position = i32::try_from(appender.delta_file().capacity()).ok()?;
                appender.delta_file().append_bytes(&record).then_some(position)
            });
        log.write_int(
            at + FIELD_OFFSET_DELTA_POSITION as u32,
            relocated.unwrap_or(NO_DELTA_POSITION),
        )?;
    }

    append_index(appender.keys_file(), "keys", key_hash, 0)?;
    appender.set_last_offset(entry.offset());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::partition::Record;
    use crate::types::DeltaType;
    use tempfile::tempdir;

    fn config() -> TopicConfig {
        TopicConfig::new()
            .segment_bytes(4096)
            .segment_index_bytes(1024)
            .min_cleanable_dirty_ratio(0.1)
            .cleanup_policy(CleanupPolicy::Compact)
    }

    fn write(partition: &mut Partition, offset: i64, key: &[u8], value: Option<&[u8]>) {
        partition.mark_ancestor(Some(key), offset).unwrap();
        partition
            .write_entry(&Record::new(offset, Some(key), value), None, DeltaType::None)
            .unwrap();
    }

    fn offsets(partition: &Partition, node: NodeId) -> Vec<i64> {
        let segment = partition.segment(node).unwrap();
        let mut offsets = Vec::new();
        segment
            .log_file()
            .read_bytes(0, |bytes| {
                for_each_entry(bytes, |entry| {
                    offsets.push(entry.offset());
                    Ok(())
                })
            })
            .unwrap();
        offsets
    }

    #[test]
    fn policy_timestamps() {
        let dir = tempdir().unwrap();
        let config = config()
            .segment_millis(100)
            .retention_millis(1000)
            .min_compaction_lag_millis(10)
            .min_cleanable_dirty_ratio(0.5);
        let mut partition = Partition::new(dir.path(), "test", 0, config).unwrap();
        let node = partition.append(0).unwrap();
        let segment = partition.segment(node).unwrap();

        assert_eq!(partition.retain_at(&segment), segment.timestamp() + 100);
        assert_eq!(partition.delete_at(&segment, 500), segment.timestamp() + 500);
        assert_eq!(partition.delete_at(&segment, i64::MAX), segment.timestamp() + 1000);
        assert_eq!(partition.compact_at(&segment, 0), i64::MAX);

        segment.log_file().append_bytes(&[0; 100]);
        segment.mark_dirty_bytes(10);
        assert_eq!(partition.compact_at(&segment, i64::MAX), i64::MAX);

        segment.mark_dirty_bytes(60);
        let at = partition.compact_at(&segment, i64::MAX);
        assert_eq!(at, segment.dirty_since() + 10);
        assert_eq!(segment.cleanable_at(), at);
        assert_eq!(partition.compact_at(&segment, 0), at);
    }

    #[test]
    fn max_lag_applies_below_ratio() {
        let dir = tempdir().unwrap();
        let config = config()
            .min_cleanable_dirty_ratio(0.9)
            .max_compaction_lag_millis(50);
        let mut partition = Partition::new(dir.path(), "test", 0, config).unwrap();
        let node = partition.append(0).unwrap();
        let segment = partition.segment(node).unwrap();

        segment.log_file().append_bytes(&[0; 100]);
        segment.mark_dirty_bytes(10);

        assert_eq!(partition.compact_at(&segment, 5), 5);
    }

    #[test]
    fn mark_ancestor_crosses_segments() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        write(&mut partition, 0, b"a", Some(b"1"));
        write(&mut partition, 1, b"b", Some(b"1"));
        let first = partition.head();
        partition.append(2).unwrap();

        let ancestor = partition.mark_ancestor(Some(b"a"), 2).unwrap().unwrap();
        assert_eq!(ancestor.entry().offset(), 0);

        let segment = partition.segment(first).unwrap();
        assert_eq!(segment.dirty_bytes(), ancestor.entry().sizeof() as u64);
        assert!(partition.mark_ancestor(Some(b"zzz"), 3).unwrap().is_none());
    }

    #[test]
    fn clean_drops_dirty_entries() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        for (offset, key) in [(0, b"a"), (1, b"b"), (2, b"a"), (3, b"c")] {
            write(&mut partition, offset, key, Some(b"value"));
        }
        let first = partition.head();
        partition.append(4).unwrap();

        let segment = partition.segment(first).unwrap();
        assert_eq!(partition.compact_at(&segment, i64::MAX), segment.dirty_since());
        let result = partition.clean(first, i64::MAX).unwrap().unwrap();

        assert_eq!(result.input_entries, 4);
        assert_eq!(result.output_entries, 3);
        assert_eq!(result.dirty_removed(), 1);
        assert!(result.bytes_saved > 0);
        assert!(!result.node_removed);
        assert_eq!(offsets(&partition, first), vec![1, 2, 3]);

        let cleaned = partition.segment(first).unwrap();
        assert!(cleaned.is_frozen());
        assert_eq!(cleaned.dirty_bytes(), 0);
        assert_eq!(cleaned.last_offset(), 3);
        let hash = compute_hash(&encode_key(Some(b"a")));
        assert!(!cleaned.keys_file().first(hash).is_sentinel());
        assert!(!cleaned.index_file().first(2).is_sentinel());
        assert!(cleaned.index_file().first(0).is_sentinel());
    }

    #[test]
    fn null_keys_are_never_superseded() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        for offset in 0..3 {
            assert!(partition.mark_ancestor(None, offset).unwrap().is_none());
            partition
                .write_entry(&Record::new(offset, None, Some(b"v")), None, DeltaType::None)
                .unwrap();
        }
        let first = partition.head();
        assert!(partition
            .find_and_mark_ancestor(first, None, compute_hash(&encode_key(None)), 3)
            .unwrap()
            .is_none());
        partition.append(3).unwrap();

        assert_eq!(partition.segment(first).unwrap().dirty_bytes(), 0);
        let result = partition.clean(first, i64::MAX).unwrap().unwrap();
        assert_eq!(result.dirty_removed(), 0);
        assert_eq!(offsets(&partition, first), vec![0, 1, 2]);
    }

    #[test]
    fn clean_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        for (offset, key) in [(0, b"a"), (1, b"a"), (2, b"b")] {
            write(&mut partition, offset, key, Some(b"value"));
        }
        let first = partition.head();
        partition.append(3).unwrap();

        partition.clean(first, i64::MAX).unwrap().unwrap();
        let once = offsets(&partition, first);
        let again = partition.clean(first, i64::MAX).unwrap().unwrap();

        assert_eq!(again.dirty_removed(), 0);
        assert_eq!(offsets(&partition, first), once);
    }

    #[test]
    fn clean_removes_empty_segments() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        write(&mut partition, 0, b"a", Some(b"1"));
        let first = partition.head();
        let head = partition.append(1).unwrap();
        write(&mut partition, 1, b"a", Some(b"2"));

        let result = partition.clean(first, i64::MAX).unwrap().unwrap();

        assert!(result.node_removed);
        assert_eq!(partition.first(), head);
        assert!(partition.segment(first).is_none());
    }

    #[test]
    fn clean_skips_appendable_and_future() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        write(&mut partition, 0, b"a", Some(b"1"));
        write(&mut partition, 1, b"a", Some(b"2"));
        let first = partition.head();

        assert!(partition.clean(first, i64::MAX).unwrap().is_none());
        partition.append(2).unwrap();
        assert!(partition.clean(first, i64::MIN).unwrap().is_none());
    }

    #[test]
    fn clean_relocates_deltas() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        let values: [&[u8]; 3] = [br#"{"a":1}"#, br#"{"a":2}"#, br#"{"a":3}"#];
        for (offset, value) in values.iter().enumerate() {
            let offset = offset as i64;
            let ancestor = partition.mark_ancestor(Some(b"k"), offset).unwrap();
            partition
                .write_entry(
                    &Record::new(offset, Some(b"k"), Some(*value)),
                    ancestor.as_ref().map(EntryBuf::entry).as_ref(),
                    DeltaType::JsonPatch,
                )
                .unwrap();
        }
        let first = partition.head();
        partition.append(3).unwrap();

        partition.clean(first, i64::MAX).unwrap().unwrap();

        let segment = partition.segment(first).unwrap();
        let mut survivors = Vec::new();
        segment
            .log_file()
            .read_bytes(0, |bytes| {
                for_each_entry(bytes, |e| {
                    survivors.push((e.offset(), e.delta_position()));
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(survivors, vec![(2, 0)]);

        let record = read_delta_record(segment.delta_file(), 0).unwrap();
        assert_eq!(segment.delta_file().capacity() as usize, record.len());
        let patched = crate::delta::apply_bytes(values[1], &record[4..]).unwrap();
        assert_eq!(patched, values[2]);
    }

    #[test]
    fn abort_producer() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        for (offset, owner) in [(0, 7), (1, 8), (2, 7)] {
            partition
                .write_entry(
                    &Record::new(offset, Some(b"k"), Some(b"v")).owner_id(owner),
                    None,
                    DeltaType::None,
                )
                .unwrap();
        }
        partition
            .write_entry(
                &Record::new(3, None, None).owner_id(7).flags(EntryFlags::CONTROL),
                None,
                DeltaType::None,
            )
            .unwrap();

        let head = partition.head();
        assert_eq!(partition.find_and_abort_producer_id(head, 7).unwrap(), 2);

        let segment = partition.segment(head).unwrap();
        let mut aborted = Vec::new();
        segment
            .log_file()
            .read_bytes(0, |bytes| {
                for_each_entry(bytes, |e| {
                    aborted.push(e.flags().is_aborted());
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(aborted, vec![true, false, true, false]);
    }

    #[test]
    fn mark_dirty_by_offset() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::new(dir.path(), "test", 0, config()).unwrap();
        write(&mut partition, 10, b"a", Some(b"1"));
        write(&mut partition, 11, b"b", Some(b"1"));
        let head = partition.head();

        let entry = partition.find_and_mark_dirty(head, 11).unwrap().unwrap();
        assert_eq!(entry.entry().offset(), 11);
        assert!(partition.find_and_mark_dirty(head, 12).unwrap().is_none());
        assert!(partition.find_and_mark_dirty(head, 5).unwrap().is_none());
        assert_eq!(
            partition.segment(head).unwrap().dirty_bytes(),
            entry.entry().sizeof() as u64
        );
    }
}
