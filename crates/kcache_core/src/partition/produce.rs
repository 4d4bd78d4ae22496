//! The produce-path write protocol.
//!
//! Produce entries are written before their payload has fully arrived and
//! before the broker has acknowledged them, so the value and trailers are
//! reserved up front and filled in place:
//!
//! ```text
//! start     header, key, value length, zeroed value area, headers,
//!           empty trailers + padding over trailers_size_max, offset index
//! continue  value fragments copied into the reserved area
//! fin       trailers into the reserved space, acknowledge, COMPLETED flag
//! ```

use super::{append_bytes, append_index, Partition};
use crate::entry::{
    encode_headers, encode_key, EntryHeader, Header, EMPTY_ARRAY, FIELD_OFFSET_ACKNOWLEDGE,
    NO_DELTA_POSITION, SIZEOF_EMPTY_ARRAY, SIZEOF_PADDING_LENGTH,
};
use crate::error::{CacheError, CacheResult};
use crate::segment::Segment;
use crate::types::{AckMode, EntryFlags};
use std::sync::Arc;

/// Acknowledge value until [`Partition::write_produce_entry_fin`] runs.
pub const NO_ACKNOWLEDGE: i64 = 0;

/// A produce entry to reserve with
/// [`Partition::write_produce_entry_start`].
#[derive(Debug, Clone, Copy)]
pub struct ProduceEntry<'a> {
    /// Partition offset.
    pub offset: i64,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// Producer id.
    pub owner_id: i64,
    /// Producer sequence.
    pub sequence: i32,
    /// Acknowledgement mode.
    pub ack_mode: AckMode,
    /// Key, `None` for a null key.
    pub key: Option<&'a [u8]>,
    /// Full value length, `-1` for a tombstone.
    pub value_len: i32,
    /// Headers.
    pub headers: &'a [Header],
    /// Bytes reserved for trailers, at least the size of an empty array.
    pub trailers_size_max: usize,
}

/// Where a reserved produce entry lives, threaded through continue and fin.
#[derive(Debug, Clone)]
pub struct ProduceMark {
    segment: Arc<Segment>,
    entry_at: u32,
    value_at: u32,
    value_limit: u32,
    value_end: u32,
}

impl ProduceMark {
    /// Returns the entry's log position.
    #[must_use]
    pub fn entry_position(&self) -> u32 {
        self.entry_at
    }

    /// Returns the number of value bytes written so far.
    #[must_use]
    pub fn value_written(&self) -> u32 {
        self.value_limit - self.value_at
    }

    /// Returns the number of value bytes still expected.
    #[must_use]
    pub fn value_remaining(&self) -> u32 {
        self.value_end - self.value_limit
    }
}

impl Partition {
    /// Reserves a produce entry in the head segment, rolling over if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NonMonotonicOffset`] if the offset does not
    /// advance the partition, or [`CacheError::CapacityExhausted`] if the
    /// reservation does not fit an empty segment.
    pub fn write_produce_entry_start(&mut self, entry: &ProduceEntry<'_>) -> CacheResult<ProduceMark> {
        self.check_progress(entry.offset)?;

        let trailers_size_max = entry.trailers_size_max.max(SIZEOF_EMPTY_ARRAY);
        let encoded_headers = encode_headers(entry.headers);
        let head = self.new_head_if_necessary(
            entry.offset,
            entry.key,
            entry.value_len,
            encoded_headers.len() + trailers_size_max,
        )?;
        let segment = self.segment(head).ok_or(CacheError::NoHeadSegment)?;
        let log = segment.log_file();
        let entry_at = log.capacity();

        let header = EntryHeader {
            offset: entry.offset,
            timestamp: entry.timestamp,
            owner_id: entry.owner_id,
            acknowledge: NO_ACKNOWLEDGE,
            sequence: entry.sequence,
            flags: EntryFlags::NONE,
            delta_position: NO_DELTA_POSITION,
            ack_mode: entry.ack_mode.value(),
            ..EntryHeader::default()
        };
        append_bytes(log, "log", &header.encode())?;
        append_bytes(log, "log", &encode_key(entry.key))?;
        append_bytes(log, "log", &entry.value_len.to_be_bytes())?;

        let value_at = log.capacity();
        let value_max = u32::try_from(entry.value_len).unwrap_or(0);
        let value_end = reserve(log, value_at, value_max as usize)?;
        append_bytes(log, "log", &encoded_headers)?;

        let trailers_at = log.capacity();
        reserve(log, trailers_at, trailers_size_max + SIZEOF_PADDING_LENGTH)?;
        log.write_bytes(trailers_at, &EMPTY_ARRAY)?;
        log.write_int(
            trailers_at + SIZEOF_EMPTY_ARRAY as u32,
            padding(trailers_size_max, SIZEOF_EMPTY_ARRAY),
        )?;

        let offset_delta = u32::try_from(entry.offset - segment.base_offset()).map_err(|_| {
            CacheError::segment_corruption(format!("offset {} below base of {segment}", entry.offset))
        })?;
        append_index(segment.index_file(), "index", offset_delta, entry_at)?;

        self.progress = entry.offset;
        segment.set_last_offset(entry.offset);
        Ok(ProduceMark {
            segment,
            entry_at,
            value_at,
            value_limit: value_at,
            value_end,
        })
    }

    /// Copies a value fragment into the reserved value area.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CapacityExhausted`] if the fragment overruns the
    /// value length given at start.
    pub fn write_produce_entry_continue(&self, mark: &mut ProduceMark, fragment: &[u8]) -> CacheResult<()> {
        let len = u32::try_from(fragment.len()).unwrap_or(u32::MAX);
        if len > mark.value_remaining() {
            return Err(CacheError::capacity_exhausted(
                "value",
                fragment.len(),
                mark.value_remaining(),
            ));
        }
        mark.segment.log_file().write_bytes(mark.value_limit, fragment)?;
        mark.value_limit += len;
        Ok(())
    }

    /// Completes a produce entry: writes `trailers` into the reserved space,
    /// then the acknowledge value, then the COMPLETED flag.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CapacityExhausted`] if the trailers exceed the
    /// reserved space, or an error if the reservation is unreadable.
    pub fn write_produce_entry_fin(
        &self,
        mark: ProduceMark,
        acknowledge: i64,
        trailers: &[Header],
    ) -> CacheResult<()> {
        let log = mark.segment.log_file();
        let corrupt = || {
            CacheError::segment_corruption(format!(
                "unreadable produce entry at {} of {}",
                mark.entry_at, mark.segment
            ))
        };

        let headers_size = log.read_int(mark.value_end).ok_or_else(corrupt)?;
        let trailers_at = mark.value_end
            + SIZEOF_EMPTY_ARRAY as u32
            + u32::try_from(headers_size).map_err(|_| corrupt())?;
        let reserved = log
            .read_int(trailers_at + SIZEOF_EMPTY_ARRAY as u32)
            .ok_or_else(corrupt)?;
        let trailers_size_max = SIZEOF_EMPTY_ARRAY + usize::try_from(reserved).map_err(|_| corrupt())?;

        if !trailers.is_empty() {
            let encoded = encode_headers(trailers);
            if encoded.len() > trailers_size_max {
                return Err(CacheError::capacity_exhausted(
                    "trailers",
                    encoded.len(),
                    u32::try_from(trailers_size_max).unwrap_or(u32::MAX),
                ));
            }
            log.write_bytes(trailers_at, &encoded)?;
            log.write_int(
                trailers_at + encoded.len() as u32,
                padding(trailers_size_max, encoded.len()),
            )?;
        }

        log.write_long(mark.entry_at + FIELD_OFFSET_ACKNOWLEDGE as u32, acknowledge)?;
        mark.segment.mark_flags(mark.entry_at, EntryFlags::COMPLETED)?;
        Ok(())
    }
}

/// Advances `log` by `len` zeroed bytes from `at`, returning the new end.
fn reserve(log: &kcache_storage::SegmentFile, at: u32, len: usize) -> CacheResult<u32> {
    let end = u32::try_from(len)
        .ok()
        .and_then(|len| at.checked_add(len))
        .filter(|&end| log.advance(end));
    end.ok_or_else(|| CacheError::capacity_exhausted("log", len, log.available()))
}

fn padding(reserved: usize, used: usize) -> i32 {
    i32::try_from(reserved - used).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::entry::{CacheEntry, EntryBuf};
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    fn partition(dir: &std::path::Path) -> Partition {
        let config = TopicConfig::new().segment_bytes(4096).segment_index_bytes(1024);
        Partition::new_produce(dir, "test", 0, 0, config, Arc::new(AtomicU64::new(0))).unwrap()
    }

    fn produce(offset: i64, value_len: i32, headers: &[Header]) -> ProduceEntry<'_> {
        ProduceEntry {
            offset,
            timestamp: 100,
            owner_id: 9,
            sequence: 3,
            ack_mode: AckMode::LeaderOnly,
            key: Some(b"key"),
            value_len,
            headers,
            trailers_size_max: 64,
        }
    }

    fn read(partition: &Partition, position: u32) -> Option<EntryBuf> {
        let segment = partition.segment(partition.head()).unwrap();
        segment
            .log_file()
            .read_bytes(position, |b| CacheEntry::try_wrap(b, position).map(|e| EntryBuf::copy_of(&e)))
    }

    #[test]
    fn reserved_entry_is_readable_before_fin() {
        let dir = tempdir().unwrap();
        let mut partition = partition(dir.path());
        let headers = [Header::new("h", "v")];

        let mark = partition.write_produce_entry_start(&produce(0, 6, &headers)).unwrap();

        let buf = read(&partition, mark.entry_position()).unwrap();
        let entry = buf.entry();
        assert_eq!(entry.value(), Some(&[0u8; 6][..]));
        assert_eq!(entry.headers().count(), 1);
        assert_eq!(entry.trailers().count(), 0);
        assert_eq!(entry.acknowledge(), NO_ACKNOWLEDGE);
        assert_eq!(entry.sequence(), 3);
        assert_eq!(entry.ack_mode(), AckMode::LeaderOnly.value());
        assert!(!entry.flags().contains(EntryFlags::COMPLETED));
        assert_eq!(partition.segment(partition.head()).unwrap().index_file().first(0).value, 0);
        assert_eq!(partition.produce_capacity(), 4096);
    }

    #[test]
    fn fin_writes_trailers_and_completes() {
        let dir = tempdir().unwrap();
        let mut partition = partition(dir.path());

        let mut mark = partition.write_produce_entry_start(&produce(0, 6, &[])).unwrap();
        partition.write_produce_entry_continue(&mut mark, b"abc").unwrap();
        partition.write_produce_entry_continue(&mut mark, b"def").unwrap();
        assert_eq!(mark.value_written(), 6);
        assert!(partition.write_produce_entry_continue(&mut mark, b"g").is_err());

        let at = mark.entry_position();
        let size_before = read(&partition, at).unwrap().entry().sizeof();
        partition
            .write_produce_entry_fin(mark, 77, &[Header::new("t", "1")])
            .unwrap();

        let buf = read(&partition, at).unwrap();
        let entry = buf.entry();
        assert_eq!(entry.value(), Some(&b"abcdef"[..]));
        assert_eq!(entry.acknowledge(), 77);
        assert!(entry.flags().contains(EntryFlags::COMPLETED));
        let trailers: Vec<_> = entry.trailers().collect();
        assert_eq!(trailers.len(), 1);
        assert_eq!(trailers[0].name, b"t");
        assert_eq!(entry.sizeof(), size_before);
    }

    #[test]
    fn trailers_must_fit_reservation() {
        let dir = tempdir().unwrap();
        let mut partition = partition(dir.path());
        let mark = partition.write_produce_entry_start(&produce(0, 0, &[])).unwrap();
        let big = Header::new("t", vec![b'x'; 100]);

        let err = partition.write_produce_entry_fin(mark, 1, &[big]).unwrap_err();
        assert!(matches!(err, CacheError::CapacityExhausted { file: "trailers", .. }));
    }

    #[test]
    fn produce_offsets_are_monotonic() {
        let dir = tempdir().unwrap();
        let mut partition = partition(dir.path());
        partition.write_produce_entry_start(&produce(4, 0, &[])).unwrap();

        assert!(matches!(
            partition.write_produce_entry_start(&produce(4, 0, &[])),
            Err(CacheError::NonMonotonicOffset { .. })
        ));
        assert_eq!(partition.next_offset(0), 5);
    }
}
