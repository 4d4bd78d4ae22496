//! The fetch-path write protocol.
//!
//! ```text
//! write_entry_start     header, key, value length; hash, nulls and keys records
//! write_entry_continue  value fragment (zero or more times)
//! write_entry_finish    headers, trailers, padding; offset index and header
//!                       hash records; JSON patch delta; last offset
//! ```

use super::{append_bytes, append_index, Partition};
use crate::entry::{
    compute_hash, encode_headers, encode_key, encoded_headers_len, CacheEntry, EntryHeader, Header,
    EMPTY_ARRAY, FIELD_OFFSET_DELTA_POSITION, FIELD_OFFSET_KEY, NO_ANCESTOR_OFFSET,
    NO_DELTA_POSITION, NULL_LENGTH, SIZEOF_EMPTY_ARRAY, SIZEOF_LENGTH, SIZEOF_PADDING_LENGTH,
};
use crate::error::{CacheError, CacheResult};
use crate::node::NodeId;
use crate::segment::{now_millis, Segment};
use crate::types::{DeltaType, EntryFlags};
use kcache_storage::SIZEOF_INDEX_RECORD;
use std::sync::Arc;
use tracing::{debug, warn};

/// State carried from `write_entry_start` to `write_entry_finish`.
#[derive(Debug)]
pub(super) struct PendingEntry {
    segment: Arc<Segment>,
    entry_at: u32,
    offset: i64,
    delta_position: i32,
    ancestor_value: Option<Vec<u8>>,
}

/// A complete entry for [`Partition::write_entry`].
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Partition offset.
    pub offset: i64,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// Producer id, `-1` if none.
    pub owner_id: i64,
    /// Key, `None` for a null key.
    pub key: Option<&'a [u8]>,
    /// Value, `None` for a tombstone.
    pub value: Option<&'a [u8]>,
    /// Headers.
    pub headers: &'a [Header],
    /// Initial flags.
    pub flags: EntryFlags,
}

impl<'a> Record<'a> {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(offset: i64, key: Option<&'a [u8]>, value: Option<&'a [u8]>) -> Self {
        Self {
            offset,
            timestamp: now_millis(),
            owner_id: -1,
            key,
            value,
            headers: &[],
            flags: EntryFlags::NONE,
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the producer id.
    #[must_use]
    pub const fn owner_id(mut self, owner_id: i64) -> Self {
        self.owner_id = owner_id;
        self
    }

    /// Sets the headers.
    #[must_use]
    pub const fn headers(mut self, headers: &'a [Header]) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the initial flags.
    #[must_use]
    pub const fn flags(mut self, flags: EntryFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Bytes an entry needs in each file of the head segment.
#[derive(Debug, Clone, Copy)]
struct Required {
    log: usize,
    hash: usize,
    index: usize,
}

impl Required {
    fn new(key: Option<&[u8]>, value_len: i32, headers_size_max: usize) -> Self {
        let key_len = SIZEOF_LENGTH + key.map_or(0, <[u8]>::len);
        let value_len = usize::try_from(value_len).unwrap_or(0);
        let record = SIZEOF_INDEX_RECORD as usize;
        Self {
            log: FIELD_OFFSET_KEY
                + key_len
                + SIZEOF_LENGTH
                + value_len
                + headers_size_max
                + SIZEOF_EMPTY_ARRAY
                + SIZEOF_PADDING_LENGTH,
            hash: (1 + (headers_size_max >> 2)) * record,
            index: record,
        }
    }

    fn check(&self, segment: &Segment) -> CacheResult<()> {
        let files = [
            ("log", self.log, segment.log_file().available()),
            ("index", self.index, segment.index_file().available()),
            ("hash", self.hash, segment.hash_file().available()),
            ("keys", self.index, segment.keys_file().available()),
            ("nulls", self.index, segment.nulls_file().available()),
        ];
        for (file, required, available) in files {
            if required > available as usize {
                return Err(CacheError::capacity_exhausted(file, required, available));
            }
        }
        Ok(())
    }
}

impl Partition {
    /// Returns the head node, first appending a new segment at `offset` if
    /// the partition is empty or the head lacks room for an entry of this
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CapacityExhausted`] if the entry does not fit
    /// even an empty segment, or an error from [`append`](Self::append).
    pub fn new_head_if_necessary(
        &mut self,
        offset: i64,
        key: Option<&[u8]>,
        value_len: i32,
        headers_size_max: usize,
    ) -> CacheResult<NodeId> {
        let required = Required::new(key, value_len, headers_size_max);
        let head = self.head();
        if let Some(segment) = self.segment(head).filter(|s| !s.is_frozen()) {
            match required.check(&segment) {
                Ok(()) => return Ok(head),
                // a fresh segment is as roomy as any replacement
                Err(error) if segment.log_file().is_empty() => return Err(error),
                Err(_) => {}
            }
        }

        let head = self.append(offset)?;
        let segment = self.segment(head).ok_or(CacheError::NoHeadSegment)?;
        required.check(&segment)?;
        Ok(head)
    }

    fn writable_head(&self) -> CacheResult<Arc<Segment>> {
        self.segment(self.head())
            .filter(|s| !s.is_frozen())
            .ok_or(CacheError::NoHeadSegment)
    }

    pub(super) fn check_progress(&self, offset: i64) -> CacheResult<()> {
        if offset <= self.progress {
            return Err(CacheError::NonMonotonicOffset {
                offset,
                progress: self.progress,
            });
        }
        Ok(())
    }

    /// Starts an entry in the head segment.
    ///
    /// With [`DeltaType::JsonPatch`], an `ancestor` carrying a value and a
    /// non-null new value, the entry reserves a delta that
    /// [`write_entry_finish`](Self::write_entry_finish) fills in.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NonMonotonicOffset`] if `offset` does not
    /// advance the partition, [`CacheError::NoHeadSegment`] if no head is
    /// appendable, or [`CacheError::CapacityExhausted`] if a file runs out of
    /// room. Call [`new_head_if_necessary`](Self::new_head_if_necessary)
    /// first to roll over.
    #[allow(clippy::too_many_arguments)]
    pub fn write_entry_start(
        &mut self,
        offset: i64,
        timestamp: i64,
        owner_id: i64,
        key: Option<&[u8]>,
        value_len: i32,
        ancestor: Option<&CacheEntry<'_>>,
        flags: EntryFlags,
        delta_type: DeltaType,
    ) -> CacheResult<()> {
        self.check_progress(offset)?;
        let segment = self.writable_head()?;
        let log = segment.log_file();

        log.mark();
        let entry_at = log.mark_value();

        let ancestor_value = ancestor
            .filter(|_| delta_type == DeltaType::JsonPatch && value_len != NULL_LENGTH)
            .and_then(|a| a.value())
            .map(<[u8]>::to_vec);
        let delta_position = match ancestor_value {
            Some(_) => i32::try_from(segment.delta_file().capacity()).unwrap_or(NO_DELTA_POSITION),
            None => NO_DELTA_POSITION,
        };

        let mut flags = flags;
        if let (Some(key), Some(validator)) = (key, &self.key_validator) {
            if !validator.validate(key) {
                flags = flags.union(EntryFlags::ABORTED);
                self.warn_invalid(offset);
            }
        }

        let header = EntryHeader {
            offset,
            timestamp,
            owner_id,
            ancestor: ancestor.map_or(NO_ANCESTOR_OFFSET, CacheEntry::offset),
            flags,
            delta_position,
            ..EntryHeader::default()
        };
        let encoded_key = encode_key(key);
        append_bytes(log, "log", &header.encode())?;
        append_bytes(log, "log", &encoded_key)?;
        append_bytes(log, "log", &value_len.to_be_bytes())?;

        let key_hash = compute_hash(&encoded_key);
        append_index(segment.hash_file(), "hash", key_hash, entry_at)?;
        if value_len == NULL_LENGTH {
            let delta = timestamp.saturating_sub(segment.timestamp()).max(0);
            let delta = u32::try_from(delta).unwrap_or(u32::MAX);
            append_index(segment.nulls_file(), "nulls", delta, entry_at)?;
        }
        append_index(segment.keys_file(), "keys", key_hash, 0)?;

        self.progress = offset;
        self.pending = Some(PendingEntry {
            segment,
            entry_at,
            offset,
            delta_position,
            ancestor_value,
        });
        Ok(())
    }

    /// Appends a fragment of the value of the started entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NoPendingEntry`] if no entry was started, or
    /// [`CacheError::CapacityExhausted`] if the log runs out of room.
    pub fn write_entry_continue(&mut self, fragment: &[u8]) -> CacheResult<()> {
        let pending = self.pending.as_ref().ok_or(CacheError::NoPendingEntry)?;
        append_bytes(pending.segment.log_file(), "log", fragment)
    }

    /// Completes the started entry.
    ///
    /// A value rejected by the value validator flags the entry ABORTED. A
    /// delta that cannot be computed or stored leaves the entry without
    /// one; readers then see the full value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NoPendingEntry`] if no entry was started,
    /// [`CacheError::CapacityExhausted`] if a file runs out of room, or a
    /// storage error.
    pub fn write_entry_finish(&mut self, headers: &[Header], delta_type: DeltaType) -> CacheResult<()> {
        let pending = self.pending.take().ok_or(CacheError::NoPendingEntry)?;
        let segment = &pending.segment;
        let log = segment.log_file();

        append_bytes(log, "log", &encode_headers(headers))?;
        append_bytes(log, "log", &EMPTY_ARRAY)?;
        append_bytes(log, "log", &0i32.to_be_bytes())?;

        let offset_delta = u32::try_from(pending.offset - segment.base_offset()).map_err(|_| {
            CacheError::segment_corruption(format!(
                "offset {} below base of {segment}",
                pending.offset
            ))
        })?;
        append_index(segment.index_file(), "index", offset_delta, pending.entry_at)?;
        for header in headers {
            append_index(
                segment.hash_file(),
                "hash",
                compute_hash(&header.encode()),
                pending.entry_at,
            )?;
        }

        let value = log
            .read_bytes(pending.entry_at, |bytes| {
                CacheEntry::try_wrap(bytes, pending.entry_at)
                    .map(|entry| entry.value().map(<[u8]>::to_vec))
            })
            .ok_or_else(|| {
                CacheError::segment_corruption(format!(
                    "incomplete entry at {} of {segment}",
                    pending.entry_at
                ))
            })?;

        if pending.delta_position != NO_DELTA_POSITION {
            let stored = match (delta_type, &pending.ancestor_value, &value) {
                (DeltaType::JsonPatch, Some(ancestor), Some(value)) => {
                    write_delta(segment, ancestor, value)
                }
                _ => false,
            };
            if !stored {
                log.write_int(
                    pending.entry_at + FIELD_OFFSET_DELTA_POSITION as u32,
                    NO_DELTA_POSITION,
                )?;
            }
        }

        if let (Some(validator), Some(value)) = (&self.value_validator, &value) {
            if !validator.validate(value) {
                segment.mark_flags(pending.entry_at, EntryFlags::ABORTED)?;
                self.warn_invalid(pending.offset);
            }
        }

        segment.set_last_offset(pending.offset);
        Ok(())
    }

    /// Writes a complete entry, rolling to a new head segment if needed.
    ///
    /// # Errors
    ///
    /// See [`write_entry_start`](Self::write_entry_start) and
    /// [`write_entry_finish`](Self::write_entry_finish).
    pub fn write_entry(
        &mut self,
        record: &Record<'_>,
        ancestor: Option<&CacheEntry<'_>>,
        delta_type: DeltaType,
    ) -> CacheResult<()> {
        let value_len = match record.value {
            Some(value) => i32::try_from(value.len())
                .map_err(|_| CacheError::capacity_exhausted("log", value.len(), 0))?,
            None => NULL_LENGTH,
        };
        self.new_head_if_necessary(
            record.offset,
            record.key,
            value_len,
            encoded_headers_len(record.headers),
        )?;
        self.write_entry_start(
            record.offset,
            record.timestamp,
            record.owner_id,
            record.key,
            value_len,
            ancestor,
            record.flags,
            delta_type,
        )?;
        if let Some(value) = record.value {
            self.write_entry_continue(value)?;
        }
        self.write_entry_finish(record.headers, delta_type)
    }

    pub(super) fn warn_invalid(&self, offset: i64) {
        warn!(
            "skipping invalid message on topic {}, partition {}, offset {}",
            self.topic, self.id, offset
        );
    }
}

/// Appends the patch from `ancestor` to `value` to the delta file. Returns
/// `false` if no usable patch was stored.
fn write_delta(segment: &Segment, ancestor: &[u8], value: &[u8]) -> bool {
    // a patch may be larger than the value it encodes; it is kept if it fits
    let patch = match crate::delta::diff_bytes(ancestor, value) {
        Ok(patch) => patch,
        Err(error) => {
            debug!(%error, segment = %segment, "value is not JSON, storing no delta");
            return false;
        }
    };
    let Ok(len) = i32::try_from(patch.len()) else {
        return false;
    };
    let mut record = Vec::with_capacity(SIZEOF_LENGTH + patch.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&patch);
    segment.delta_file().append_bytes(&record)
}
