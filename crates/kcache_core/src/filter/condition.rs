//! Compiled filter conditions.
//!
//! A condition narrows a segment to candidate log positions through the
//! segment's index files, then confirms each candidate against the entry:
//!
//! ```text
//! reset(segment, offset)  -> first candidate position in the segment
//! next(segment, position) -> first candidate at or after position
//! test(entry)             -> match mask, 0 for no match
//! ```
//!
//! A position is a log position or one of two sentinels:
//! [`RETRY_SEGMENT_VALUE`] when nothing matches yet but the segment can
//! still grow, and [`NEXT_SEGMENT_VALUE`] when nothing is left in the
//! segment.
//!
//! ## Invariants
//!
//! - `next(segment, p)` never returns a log position below `p`
//! - Walks over-approximate: hash collisions are rejected by `test`, which
//!   compares encoded bytes
//! - `And` is exhausted for a segment as soon as one child is

use super::{Skip, ValueMatch};
use crate::entry::{compute_hash, encode_header, encode_key, CacheEntry};
use crate::segment::Segment;
use crate::types::Evaluation;
use kcache_storage::{IndexCursor, NEXT_SEGMENT_VALUE, RETRY_SEGMENT_VALUE};

/// Returns `true` for the retry and next-segment sentinels.
#[must_use]
pub const fn is_sentinel(position: i32) -> bool {
    position == RETRY_SEGMENT_VALUE || position == NEXT_SEGMENT_VALUE
}

/// A compiled condition tree with its per-segment walk state.
///
/// Cloning yields a condition with the same predicate; walk state is reset
/// on the next [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub enum Condition {
    /// Every entry, walked through the offset index.
    None(OffsetWalk),
    /// Key equals.
    Key(Equals),
    /// Some header equals.
    Header(Equals),
    /// Negation.
    Not(Box<NotCondition>),
    /// Ordered values of one header name.
    HeaderSequence(Box<HeaderSequence>),
    /// Every child matches.
    And(Vec<Condition>),
    /// Some child matches. Child `i` owns bit `1 << i` of the mask.
    Or {
        /// Filter groups.
        conditions: Vec<Condition>,
        /// Whether `test` stops at the first match.
        evaluation: Evaluation,
    },
}

impl Condition {
    /// Matches every entry.
    #[must_use]
    pub fn none() -> Self {
        Self::None(OffsetWalk::new())
    }

    /// Matches entries whose key equals `key`; `None` matches null keys.
    #[must_use]
    pub fn key(key: Option<&[u8]>) -> Self {
        Self::Key(Equals::new(encode_key(key)))
    }

    /// Matches entries carrying the header `name: value`.
    #[must_use]
    pub fn header(name: &[u8], value: Option<&[u8]>) -> Self {
        Self::Header(Equals::new(encode_header(name, value)))
    }

    /// Negates `nested`.
    #[must_use]
    pub fn not(nested: Self) -> Self {
        Self::Not(Box::new(NotCondition {
            walk: OffsetWalk::new(),
            nested,
            skip: RETRY_SEGMENT_VALUE,
        }))
    }

    /// Matches the headers named `name` against `matches` in order.
    #[must_use]
    pub fn header_sequence(name: &[u8], matches: &[ValueMatch]) -> Self {
        let mut required: Vec<Self> = matches
            .iter()
            .filter_map(|m| match m {
                ValueMatch::Value(value) => Some(Self::header(name, Some(value.as_slice()))),
                ValueMatch::Skip(_) => None,
            })
            .collect();
        let walk = match required.len() {
            0 => Self::none(),
            1 => required.swap_remove(0),
            _ => Self::And(required),
        };
        Self::HeaderSequence(Box::new(HeaderSequence {
            name: name.to_vec(),
            matches: matches.to_vec(),
            walk,
        }))
    }

    /// Matches when every child matches.
    #[must_use]
    pub fn and(conditions: Vec<Self>) -> Self {
        Self::And(conditions)
    }

    /// Matches when some child matches.
    #[must_use]
    pub fn or(conditions: Vec<Self>, evaluation: Evaluation) -> Self {
        Self::Or {
            conditions,
            evaluation,
        }
    }

    /// Positions the walk at `offset` in `segment` and returns the first
    /// candidate position.
    ///
    /// `position` is the log position of `offset` when the caller already
    /// resolved it; `None` resolves it through the offset index.
    pub fn reset(&mut self, segment: &Segment, offset: i64, position: Option<i32>) -> i32 {
        match self {
            Self::None(walk) => walk.reset(segment, offset),
            Self::Key(equals) | Self::Header(equals) => equals.reset(segment, offset, position),
            Self::Not(not) => not.reset(segment, offset, position),
            Self::HeaderSequence(sequence) => sequence.walk.reset(segment, offset, position),
            Self::And(conditions) => {
                let position = position.unwrap_or_else(|| start_position(segment, offset));
                let mut exhausted = false;
                let mut retry = false;
                let mut max = 0;
                for condition in conditions.iter_mut() {
                    match condition.reset(segment, offset, Some(position)) {
                        NEXT_SEGMENT_VALUE => exhausted = true,
                        RETRY_SEGMENT_VALUE => retry = true,
                        next => max = max.max(next),
                    }
                }
                if exhausted {
                    NEXT_SEGMENT_VALUE
                } else if retry {
                    RETRY_SEGMENT_VALUE
                } else {
                    max
                }
            }
            Self::Or { conditions, .. } => {
                let position = position.unwrap_or_else(|| start_position(segment, offset));
                let mut next = Earliest::default();
                for condition in conditions.iter_mut() {
                    next.add(condition.reset(segment, offset, Some(position)));
                }
                next.position()
            }
        }
    }

    /// Returns the first candidate position at or after `position`.
    pub fn next(&mut self, segment: &Segment, position: i32) -> i32 {
        match self {
            Self::None(walk) => walk.next(segment, position),
            Self::Key(equals) | Self::Header(equals) => equals.next(segment, position),
            Self::Not(not) => not.next(segment, position),
            Self::HeaderSequence(sequence) => sequence.walk.next(segment, position),
            Self::And(conditions) => {
                let mut target = position.max(0);
                loop {
                    let mut retry = false;
                    let mut min = i32::MAX;
                    let mut max = target;
                    for condition in conditions.iter_mut() {
                        match condition.next(segment, target) {
                            NEXT_SEGMENT_VALUE => return NEXT_SEGMENT_VALUE,
                            RETRY_SEGMENT_VALUE => retry = true,
                            next => {
                                min = min.min(next);
                                max = max.max(next);
                            }
                        }
                    }
                    if retry {
                        return RETRY_SEGMENT_VALUE;
                    }
                    if min == max || conditions.is_empty() {
                        return max;
                    }
                    target = max;
                }
            }
            Self::Or { conditions, .. } => {
                let mut next = Earliest::default();
                for condition in conditions.iter_mut() {
                    next.add(condition.next(segment, position));
                }
                next.position()
            }
        }
    }

    /// Tests `entry`, returning a non-zero mask on a match.
    ///
    /// Single conditions and groups report `1`; an `Or` reports the bits
    /// of its matching children, all of them for [`Evaluation::Eager`] and
    /// the first for [`Evaluation::Lazy`].
    #[must_use]
    pub fn test(&self, entry: &CacheEntry<'_>) -> u64 {
        match self {
            Self::None(_) => 1,
            Self::Key(equals) => u64::from(entry.key_bytes() == equals.encoded.as_slice()),
            Self::Header(equals) => {
                u64::from(entry.headers().any(|h| h.encoded() == equals.encoded.as_slice()))
            }
            Self::Not(not) => not.test(entry),
            Self::HeaderSequence(sequence) => sequence.test(entry),
            Self::And(conditions) => u64::from(conditions.iter().all(|c| c.test(entry) != 0)),
            Self::Or {
                conditions,
                evaluation,
            } => {
                let mut matched = conditions
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.test(entry) != 0)
                    .map(|(i, _)| 1u64 << i);
                match evaluation {
                    Evaluation::Lazy => matched.next().unwrap_or(0),
                    Evaluation::Eager => matched.fold(0, |mask, bit| mask | bit),
                }
            }
        }
    }
}

/// Tracks the earliest real position among `Or` children.
#[derive(Default)]
struct Earliest {
    min: Option<i32>,
    retry: bool,
}

impl Earliest {
    fn add(&mut self, position: i32) {
        match position {
            RETRY_SEGMENT_VALUE => self.retry = true,
            NEXT_SEGMENT_VALUE => {}
            next => self.min = Some(self.min.map_or(next, |min| min.min(next))),
        }
    }

    fn position(&self) -> i32 {
        match self.min {
            Some(min) => min,
            None if self.retry => RETRY_SEGMENT_VALUE,
            None => NEXT_SEGMENT_VALUE,
        }
    }
}

/// Walks every entry of a segment through its offset index.
#[derive(Debug, Clone)]
pub struct OffsetWalk {
    cursor: IndexCursor,
}

impl OffsetWalk {
    fn new() -> Self {
        Self {
            cursor: IndexCursor::new(0, RETRY_SEGMENT_VALUE),
        }
    }

    fn reset(&mut self, segment: &Segment, offset: i64) -> i32 {
        self.cursor = start_cursor(segment, offset);
        self.cursor.value
    }

    fn next(&mut self, segment: &Segment, position: i32) -> i32 {
        if position > self.cursor.value {
            self.cursor = segment
                .index_file()
                .resolve(IndexCursor::new(self.cursor.index, position));
        }
        self.cursor.value
    }
}

/// Walks the hash index for one encoded key or header.
#[derive(Debug, Clone)]
pub struct Equals {
    encoded: Vec<u8>,
    hash: u32,
    cursor: IndexCursor,
}

impl Equals {
    fn new(encoded: Vec<u8>) -> Self {
        Self {
            hash: compute_hash(&encoded),
            encoded,
            cursor: IndexCursor::new(0, RETRY_SEGMENT_VALUE),
        }
    }

    /// Returns the encoded bytes compared by `test`.
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Returns the hash probed in the hash index.
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    fn reset(&mut self, segment: &Segment, offset: i64, position: Option<i32>) -> i32 {
        let position = position.unwrap_or_else(|| start_position(segment, offset));
        let hash_file = segment.hash_file();
        let first = hash_file.first(self.hash);
        self.cursor = if first.is_sentinel() {
            first
        } else {
            hash_file.ceiling(self.hash, IndexCursor::new(first.index, position))
        };
        if self.cursor.is_retry() {
            position
        } else {
            self.cursor.value
        }
    }

    fn next(&mut self, segment: &Segment, position: i32) -> i32 {
        if position > self.cursor.value {
            self.cursor = segment
                .hash_file()
                .ceiling(self.hash, IndexCursor::new(self.cursor.index, position));
        }
        self.cursor.value
    }
}

/// Walks every entry and skips the candidates of the nested condition.
#[derive(Debug, Clone)]
pub struct NotCondition {
    walk: OffsetWalk,
    nested: Condition,
    skip: i32,
}

impl NotCondition {
    fn reset(&mut self, segment: &Segment, offset: i64, position: Option<i32>) -> i32 {
        let next = self.walk.reset(segment, offset);
        self.skip = self.nested.reset(segment, offset, position);
        next
    }

    fn next(&mut self, segment: &Segment, position: i32) -> i32 {
        let next = self.walk.next(segment, position);
        if self.skip == RETRY_SEGMENT_VALUE {
            self.skip = self.nested.next(segment, position);
        }
        while next != RETRY_SEGMENT_VALUE && !is_sentinel(self.skip) && next > self.skip {
            self.skip = self.nested.next(segment, self.skip + 1);
        }
        next
    }

    fn test(&self, entry: &CacheEntry<'_>) -> u64 {
        // The nested condition has no candidate before `skip`.
        let before_skip = i64::from(entry.position()) < i64::from(self.skip);
        u64::from(before_skip || self.nested.test(entry) == 0)
    }
}

/// Matches the values of every header with one name, in order.
///
/// The walk requires each expected value through the hash index; `test`
/// then checks order, skips and the absence of extra headers.
#[derive(Debug, Clone)]
pub struct HeaderSequence {
    name: Vec<u8>,
    matches: Vec<ValueMatch>,
    walk: Condition,
}

impl HeaderSequence {
    fn test(&self, entry: &CacheEntry<'_>) -> u64 {
        let mut matches = self.matches.iter();
        let mut skip_many = false;
        for header in entry.headers().filter(|h| h.name == self.name.as_slice()) {
            match matches.next() {
                Some(ValueMatch::Value(value)) => {
                    if header.value != Some(value.as_slice()) {
                        return 0;
                    }
                }
                Some(ValueMatch::Skip(skip)) => skip_many = *skip == Skip::Many,
                None if skip_many => {}
                None => return 0,
            }
        }
        let complete = match matches.next() {
            None => true,
            Some(ValueMatch::Skip(Skip::Many)) => matches.next().is_none(),
            Some(_) => false,
        };
        u64::from(complete)
    }
}

fn offset_delta(segment: &Segment, offset: i64) -> u32 {
    offset
        .saturating_sub(segment.base_offset())
        .clamp(0, i64::from(u32::MAX)) as u32
}

fn start_cursor(segment: &Segment, offset: i64) -> IndexCursor {
    segment.index_file().floor(offset_delta(segment, offset))
}

fn start_position(segment: &Segment, offset: i64) -> i32 {
    start_cursor(segment, offset).value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::entry::{EntryWriter, Header};
    use crate::partition::{Partition, Record};
    use crate::types::{DeltaType, EntryFlags};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry(key: Option<&[u8]>, headers: &[Header]) -> Vec<u8> {
        EntryWriter::header(0, 0, -1, -1, EntryFlags::NONE, -1)
            .key(key)
            .value(Some(b"value"))
            .headers(headers)
            .build()
    }

    fn wrap(bytes: &[u8]) -> CacheEntry<'_> {
        CacheEntry::try_wrap(bytes, 0).unwrap()
    }

    fn sequence(matches: Vec<ValueMatch>) -> Condition {
        Condition::header_sequence(b"h", &matches)
    }

    fn write(partition: &mut Partition, offset: i64, key: &[u8], headers: &[Header]) {
        partition
            .write_entry(
                &Record::new(offset, Some(key), Some(b"v")).headers(headers),
                None,
                DeltaType::None,
            )
            .unwrap();
    }

    /// Positions a condition walks in one segment, with the positions it
    /// accepts.
    fn walk(condition: &mut Condition, segment: &Arc<Segment>) -> Vec<i64> {
        let mut offsets = Vec::new();
        let mut position = condition.reset(segment, segment.base_offset(), None);
        if is_sentinel(position) {
            position = 0;
        }
        loop {
            let next = condition.next(segment, position);
            if is_sentinel(next) {
                return offsets;
            }
            let matched = segment.log_file().read_bytes(next as u32, |bytes| {
                CacheEntry::try_wrap(bytes, next as u32)
                    .map(|entry| (entry.offset(), condition.test(&entry)))
            });
            let (offset, mask) = matched.unwrap();
            if mask != 0 {
                offsets.push(offset);
            }
            position = next + 1;
        }
    }

    fn partition(dir: &std::path::Path) -> Partition {
        let config = TopicConfig::new().segment_bytes(8192).segment_index_bytes(2048);
        let mut partition = Partition::new(dir, "test", 0, config).unwrap();
        partition.append(0).unwrap();
        let a = [Header::new("type", "a")];
        let b = [Header::new("type", "b")];
        write(&mut partition, 0, b"k1", &a);
        write(&mut partition, 1, b"k2", &b);
        write(&mut partition, 2, b"k1", &b);
        write(&mut partition, 3, b"k3", &a);
        partition
    }

    #[test]
    fn equals_walks_hash_index() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        let segment = partition.segment(partition.head()).unwrap();

        assert_eq!(walk(&mut Condition::key(Some(b"k1")), &segment), vec![0, 2]);
        assert_eq!(walk(&mut Condition::header(b"type", Some(b"a")), &segment), vec![0, 3]);
        assert!(walk(&mut Condition::key(Some(b"k9")), &segment).is_empty());
    }

    #[test]
    fn equals_walks_frozen_hash_index() {
        let dir = tempdir().unwrap();
        let mut partition = partition(dir.path());
        partition.append(4).unwrap();
        let segment = partition.segment(partition.first()).unwrap();
        assert!(segment.is_frozen());

        assert_eq!(walk(&mut Condition::key(Some(b"k1")), &segment), vec![0, 2]);
        let mut missing = Condition::key(Some(b"k9"));
        assert_eq!(missing.reset(&segment, 0, None), NEXT_SEGMENT_VALUE);
    }

    #[test]
    fn missing_key_retries_while_appendable() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        let segment = partition.segment(partition.head()).unwrap();

        let mut condition = Condition::key(Some(b"k9"));
        let position = condition.reset(&segment, 0, None);
        assert_eq!(condition.next(&segment, position + 1), RETRY_SEGMENT_VALUE);
    }

    #[test]
    fn not_skips_nested_matches() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        let segment = partition.segment(partition.head()).unwrap();

        let mut condition = Condition::not(Condition::key(Some(b"k1")));
        assert_eq!(walk(&mut condition, &segment), vec![1, 3]);
    }

    #[test]
    fn and_leapfrogs_children() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        let segment = partition.segment(partition.head()).unwrap();

        let mut condition = Condition::and(vec![
            Condition::key(Some(b"k1")),
            Condition::header(b"type", Some(b"b")),
        ]);
        assert_eq!(walk(&mut condition, &segment), vec![2]);
    }

    #[test]
    fn or_reports_group_bits() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        let segment = partition.segment(partition.head()).unwrap();

        let mut eager = Condition::or(
            vec![Condition::key(Some(b"k1")), Condition::header(b"type", Some(b"a"))],
            Evaluation::Eager,
        );
        assert_eq!(walk(&mut eager, &segment), vec![0, 2, 3]);

        let first = segment
            .log_file()
            .read_bytes(0, |bytes| CacheEntry::try_wrap(bytes, 0).map(|e| eager.test(&e)));
        assert_eq!(first, Some(0b11));

        let lazy = Condition::or(
            vec![Condition::key(Some(b"k1")), Condition::header(b"type", Some(b"a"))],
            Evaluation::Lazy,
        );
        let first = segment
            .log_file()
            .read_bytes(0, |bytes| CacheEntry::try_wrap(bytes, 0).map(|e| lazy.test(&e)));
        assert_eq!(first, Some(0b01));
    }

    #[test]
    fn header_sequence_matches_in_order() {
        let headers = [Header::new("h", "1"), Header::new("x", "0"), Header::new("h", "2")];
        let bytes = entry(Some(b"key"), &headers);
        let entry = wrap(&bytes);

        let exact = sequence(vec![ValueMatch::value("1"), ValueMatch::value("2")]);
        assert_eq!(exact.test(&entry), 1);

        let reversed = sequence(vec![ValueMatch::value("2"), ValueMatch::value("1")]);
        assert_eq!(reversed.test(&entry), 0);

        let short = sequence(vec![ValueMatch::value("1")]);
        assert_eq!(short.test(&entry), 0);

        let skip_one = sequence(vec![ValueMatch::Skip(Skip::One), ValueMatch::value("2")]);
        assert_eq!(skip_one.test(&entry), 1);

        let skip_many = sequence(vec![ValueMatch::value("1"), ValueMatch::Skip(Skip::Many)]);
        assert_eq!(skip_many.test(&entry), 1);

        let too_long = sequence(vec![
            ValueMatch::value("1"),
            ValueMatch::value("2"),
            ValueMatch::Skip(Skip::One),
        ]);
        assert_eq!(too_long.test(&entry), 0);
    }

    #[test]
    fn trailing_skip_many_matches_no_headers() {
        let headers = [Header::new("h", "1")];
        let bytes = entry(Some(b"key"), &headers);
        let entry = wrap(&bytes);

        let condition = sequence(vec![ValueMatch::value("1"), ValueMatch::Skip(Skip::Many)]);
        assert_eq!(condition.test(&entry), 1);

        let empty = sequence(vec![]);
        assert_eq!(empty.test(&entry), 0);
    }

    #[test]
    fn null_key_matches_only_null_keys() {
        let null = entry(None, &[]);
        let keyed = entry(Some(b"key"), &[]);

        let condition = Condition::key(None);
        assert_eq!(condition.test(&wrap(&null)), 1);
        assert_eq!(condition.test(&wrap(&keyed)), 0);
    }
}
