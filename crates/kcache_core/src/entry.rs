//! Cache entry layout and zero-copy views.
//!
//! ```text
//! offset 0   offset          i64
//!        8   timestamp       i64
//!       16   owner id        i64
//!       24   acknowledge     i64
//!       32   sequence        i32
//!       36   ancestor        i64
//!       44   descendant      i64
//!       52   flags           i32
//!       56   delta position  i32
//!       60   ack mode        i16
//!       62   key             i32 length (-1 = null) + bytes
//!            value           i32 length (-1 = tombstone) + bytes
//!            headers         i32 items size, i32 count, items
//!            trailers        i32 items size, i32 count, items
//!            padding         i32 length + reserved bytes
//! ```
//!
//! A header item is `i32 name length, name, i32 value length (-1 = null),
//! value`. All integers are big-endian.

use crate::error::{CacheError, CacheResult};
use crate::types::EntryFlags;
use serde::{Deserialize, Serialize};

/// Position of the offset field.
pub const FIELD_OFFSET_OFFSET: usize = 0;
/// Position of the timestamp field.
pub const FIELD_OFFSET_TIMESTAMP: usize = 8;
/// Position of the owner id field.
pub const FIELD_OFFSET_OWNER_ID: usize = 16;
/// Position of the acknowledge field.
pub const FIELD_OFFSET_ACKNOWLEDGE: usize = 24;
/// Position of the sequence field.
pub const FIELD_OFFSET_SEQUENCE: usize = 32;
/// Position of the ancestor offset field.
pub const FIELD_OFFSET_ANCESTOR: usize = 36;
/// Position of the descendant offset field.
pub const FIELD_OFFSET_DESCENDANT: usize = 44;
/// Position of the flags field.
pub const FIELD_OFFSET_FLAGS: usize = 52;
/// Position of the delta position field.
pub const FIELD_OFFSET_DELTA_POSITION: usize = 56;
/// Position of the ack mode field.
pub const FIELD_OFFSET_ACK_MODE: usize = 60;
/// Position of the key.
pub const FIELD_OFFSET_KEY: usize = 62;

/// Size of the fixed entry header.
pub const SIZEOF_ENTRY_HEADER: usize = FIELD_OFFSET_KEY;
/// Size of an empty headers or trailers array.
pub const SIZEOF_EMPTY_ARRAY: usize = 8;
/// Size of the padding length that terminates an entry.
pub const SIZEOF_PADDING_LENGTH: usize = 4;
/// Size of a length prefix.
pub const SIZEOF_LENGTH: usize = 4;

/// Ancestor value when the entry has no ancestor.
pub const NO_ANCESTOR_OFFSET: i64 = -1;
/// Descendant value when the entry has not been superseded.
pub const NO_DESCENDANT_OFFSET: i64 = -1;
/// Delta position when no delta is stored.
pub const NO_DELTA_POSITION: i32 = -1;
/// Sequence value for entries outside the produce path.
pub const NO_SEQUENCE: i32 = -1;
/// Length marking a null key, value or header value.
pub const NULL_LENGTH: i32 = -1;

/// Calls `visit` with each entry of a log file's bytes, in order.
///
/// # Errors
///
/// Returns an error if an entry does not parse, or whatever `visit` returns.
pub fn for_each_entry(
    bytes: &[u8],
    mut visit: impl FnMut(&CacheEntry<'_>) -> CacheResult<()>,
) -> CacheResult<()> {
    let mut at = 0usize;
    while at < bytes.len() {
        let position = u32::try_from(at)
            .map_err(|_| CacheError::segment_corruption("log position overflow"))?;
        let entry = CacheEntry::try_wrap(&bytes[at..], position).ok_or_else(|| {
            CacheError::segment_corruption(format!("unparseable entry at position {at}"))
        })?;
        visit(&entry)?;
        at += entry.sizeof();
    }
    Ok(())
}

/// An owned header, as supplied to the write path and to filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    /// Header name.
    pub name: Vec<u8>,
    /// Header value, `None` for a null value.
    pub value: Option<Vec<u8>>,
}

impl Header {
    /// Creates a header.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Encodes this header as a header item.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode_header(&self.name, self.value.as_deref())
    }
}

/// The fixed fields at the start of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Partition offset.
    pub offset: i64,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// Owner (producer) id.
    pub owner_id: i64,
    /// Acknowledge value, written by the produce path on fin.
    pub acknowledge: i64,
    /// Producer sequence.
    pub sequence: i32,
    /// Ancestor offset.
    pub ancestor: i64,
    /// Descendant offset.
    pub descendant: i64,
    /// Entry flags.
    pub flags: EntryFlags,
    /// Delta file position.
    pub delta_position: i32,
    /// Ack mode value.
    pub ack_mode: i16,
}

impl Default for EntryHeader {
    fn default() -> Self {
        Self {
            offset: 0,
            timestamp: 0,
            owner_id: 0,
            acknowledge: 0,
            sequence: NO_SEQUENCE,
            ancestor: NO_ANCESTOR_OFFSET,
            descendant: NO_DESCENDANT_OFFSET,
            flags: EntryFlags::NONE,
            delta_position: NO_DELTA_POSITION,
            ack_mode: 0,
        }
    }
}

impl EntryHeader {
    /// Encodes the header fields.
    #[must_use]
    pub fn encode(&self) -> [u8; SIZEOF_ENTRY_HEADER] {
        let mut out = [0u8; SIZEOF_ENTRY_HEADER];
        out[FIELD_OFFSET_OFFSET..FIELD_OFFSET_TIMESTAMP].copy_from_slice(&self.offset.to_be_bytes());
        out[FIELD_OFFSET_TIMESTAMP..FIELD_OFFSET_OWNER_ID]
            .copy_from_slice(&self.timestamp.to_be_bytes());
        out[FIELD_OFFSET_OWNER_ID..FIELD_OFFSET_ACKNOWLEDGE]
            .copy_from_slice(&self.owner_id.to_be_bytes());
        out[FIELD_OFFSET_ACKNOWLEDGE..FIELD_OFFSET_SEQUENCE]
            .copy_from_slice(&self.acknowledge.to_be_bytes());
        out[FIELD_OFFSET_SEQUENCE..FIELD_OFFSET_ANCESTOR]
            .copy_from_slice(&self.sequence.to_be_bytes());
        out[FIELD_OFFSET_ANCESTOR..FIELD_OFFSET_DESCENDANT]
            .copy_from_slice(&self.ancestor.to_be_bytes());
        out[FIELD_OFFSET_DESCENDANT..FIELD_OFFSET_FLAGS]
            .copy_from_slice(&self.descendant.to_be_bytes());
        out[FIELD_OFFSET_FLAGS..FIELD_OFFSET_DELTA_POSITION]
            .copy_from_slice(&self.flags.0.to_be_bytes());
        out[FIELD_OFFSET_DELTA_POSITION..FIELD_OFFSET_ACK_MODE]
            .copy_from_slice(&self.delta_position.to_be_bytes());
        out[FIELD_OFFSET_ACK_MODE..FIELD_OFFSET_KEY].copy_from_slice(&self.ack_mode.to_be_bytes());
        out
    }
}

/// Returns the encoded size of a headers array without encoding it.
#[must_use]
pub fn encoded_headers_len(headers: &[Header]) -> usize {
    headers.iter().fold(SIZEOF_EMPTY_ARRAY, |len, header| {
        len + 2 * SIZEOF_LENGTH + header.name.len() + header.value.as_ref().map_or(0, Vec::len)
    })
}

/// Computes the index hash of an encoded key or header.
#[must_use]
pub fn compute_hash(encoded: &[u8]) -> u32 {
    crc32c::crc32c(encoded)
}

/// Encodes a key with its length prefix.
#[must_use]
pub fn encode_key(key: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIZEOF_LENGTH + key.map_or(0, <[u8]>::len));
    put_octets(&mut out, key);
    out
}

/// Encodes a single header item.
#[must_use]
pub fn encode_header(name: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * SIZEOF_LENGTH + name.len() + value.map_or(0, <[u8]>::len));
    put_octets(&mut out, Some(name));
    put_octets(&mut out, value);
    out
}

/// Encodes a headers (or trailers) array.
#[must_use]
pub fn encode_headers(headers: &[Header]) -> Vec<u8> {
    let mut items = Vec::new();
    for header in headers {
        put_octets(&mut items, Some(&header.name));
        put_octets(&mut items, header.value.as_deref());
    }
    let mut out = Vec::with_capacity(SIZEOF_EMPTY_ARRAY + items.len());
    out.extend_from_slice(&(items.len() as i32).to_be_bytes());
    out.extend_from_slice(&(headers.len() as i32).to_be_bytes());
    out.extend_from_slice(&items);
    out
}

/// Encoded form of an empty headers or trailers array.
pub const EMPTY_ARRAY: [u8; SIZEOF_EMPTY_ARRAY] = [0; SIZEOF_EMPTY_ARRAY];

fn put_octets(out: &mut Vec<u8>, octets: Option<&[u8]>) {
    match octets {
        Some(bytes) => {
            out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        None => out.extend_from_slice(&NULL_LENGTH.to_be_bytes()),
    }
}

fn get_i64(bytes: &[u8], at: usize) -> Option<i64> {
    bytes
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
}

fn get_i32(bytes: &[u8], at: usize) -> Option<i32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_be_bytes)
}

fn get_i16(bytes: &[u8], at: usize) -> Option<i16> {
    bytes
        .get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(i16::from_be_bytes)
}

/// Reads a length-prefixed octet string at `at`, returning it and its end.
fn get_octets(bytes: &[u8], at: usize) -> Option<(Option<&[u8]>, usize)> {
    let len = get_i32(bytes, at)?;
    let start = at + SIZEOF_LENGTH;
    if len == NULL_LENGTH {
        return Some((None, start));
    }
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    Some((Some(bytes.get(start..end)?), end))
}

/// Returns the end of an array starting at `at`.
fn get_array_end(bytes: &[u8], at: usize) -> Option<usize> {
    let size = usize::try_from(get_i32(bytes, at)?).ok()?;
    get_i32(bytes, at + 4)?;
    let end = (at + SIZEOF_EMPTY_ARRAY).checked_add(size)?;
    (end <= bytes.len()).then_some(end)
}

/// A read-only view of one entry.
///
/// Views are created with [`CacheEntry::try_wrap`], which succeeds only when
/// every field through the padding is present.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry<'a> {
    bytes: &'a [u8],
    position: u32,
    key_end: usize,
    value_end: usize,
    headers_end: usize,
    trailers_end: usize,
}

impl<'a> CacheEntry<'a> {
    /// Wraps the entry at the start of `bytes`, which was read from
    /// `position` of its log file.
    ///
    /// Returns `None` if the entry is incomplete.
    #[must_use]
    pub fn try_wrap(bytes: &'a [u8], position: u32) -> Option<Self> {
        if bytes.len() < SIZEOF_ENTRY_HEADER {
            return None;
        }
        let (_, key_end) = get_octets(bytes, FIELD_OFFSET_KEY)?;
        let (_, value_end) = get_octets(bytes, key_end)?;
        let headers_end = get_array_end(bytes, value_end)?;
        let trailers_end = get_array_end(bytes, headers_end)?;
        let padding = usize::try_from(get_i32(bytes, trailers_end)?).ok()?;
        let limit = (trailers_end + SIZEOF_PADDING_LENGTH).checked_add(padding)?;
        let bytes = bytes.get(..limit)?;

        Some(Self {
            bytes,
            position,
            key_end,
            value_end,
            headers_end,
            trailers_end,
        })
    }

    /// Returns the entry's position in its log file.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Returns the encoded entry.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Returns the encoded size of the entry.
    #[must_use]
    pub fn sizeof(&self) -> usize {
        self.bytes.len()
    }

    fn long(&self, at: usize) -> i64 {
        get_i64(self.bytes, at).unwrap_or_default()
    }

    fn int(&self, at: usize) -> i32 {
        get_i32(self.bytes, at).unwrap_or_default()
    }

    /// Returns the partition offset.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.long(FIELD_OFFSET_OFFSET)
    }

    /// Returns the timestamp.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.long(FIELD_OFFSET_TIMESTAMP)
    }

    /// Returns the owner (producer) id.
    #[must_use]
    pub fn owner_id(&self) -> i64 {
        self.long(FIELD_OFFSET_OWNER_ID)
    }

    /// Returns the acknowledge value.
    #[must_use]
    pub fn acknowledge(&self) -> i64 {
        self.long(FIELD_OFFSET_ACKNOWLEDGE)
    }

    /// Returns the producer sequence.
    #[must_use]
    pub fn sequence(&self) -> i32 {
        self.int(FIELD_OFFSET_SEQUENCE)
    }

    /// Returns the ancestor offset, or [`NO_ANCESTOR_OFFSET`].
    #[must_use]
    pub fn ancestor(&self) -> i64 {
        self.long(FIELD_OFFSET_ANCESTOR)
    }

    /// Returns the descendant offset, or [`NO_DESCENDANT_OFFSET`].
    #[must_use]
    pub fn descendant(&self) -> i64 {
        self.long(FIELD_OFFSET_DESCENDANT)
    }

    /// Returns the flags.
    #[must_use]
    pub fn flags(&self) -> EntryFlags {
        EntryFlags(self.int(FIELD_OFFSET_FLAGS))
    }

    /// Returns the delta file position, or [`NO_DELTA_POSITION`].
    #[must_use]
    pub fn delta_position(&self) -> i32 {
        self.int(FIELD_OFFSET_DELTA_POSITION)
    }

    /// Returns the ack mode.
    #[must_use]
    pub fn ack_mode(&self) -> i16 {
        get_i16(self.bytes, FIELD_OFFSET_ACK_MODE).unwrap_or_default()
    }

    /// Returns the key, `None` for a null key.
    #[must_use]
    pub fn key(&self) -> Option<&'a [u8]> {
        get_octets(self.bytes, FIELD_OFFSET_KEY).and_then(|(key, _)| key)
    }

    /// Returns the encoded key, including its length prefix.
    #[must_use]
    pub fn key_bytes(&self) -> &'a [u8] {
        &self.bytes[FIELD_OFFSET_KEY..self.key_end]
    }

    /// Returns the position just past the key, where the value length is.
    #[must_use]
    pub fn key_end(&self) -> usize {
        self.key_end
    }

    /// Returns the value length, `-1` for a tombstone.
    #[must_use]
    pub fn value_len(&self) -> i32 {
        self.int(self.key_end)
    }

    /// Returns the value, `None` for a tombstone.
    #[must_use]
    pub fn value(&self) -> Option<&'a [u8]> {
        get_octets(self.bytes, self.key_end).and_then(|(value, _)| value)
    }

    /// Returns `true` if the value is null.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_len() == NULL_LENGTH
    }

    /// Returns the encoded headers array.
    #[must_use]
    pub fn headers_bytes(&self) -> &'a [u8] {
        &self.bytes[self.value_end..self.headers_end]
    }

    /// Returns the encoded headers, trailers and padding that follow the
    /// value.
    #[must_use]
    pub fn tail_bytes(&self) -> &'a [u8] {
        &self.bytes[self.value_end..]
    }

    /// Iterates the headers.
    #[must_use]
    pub fn headers(&self) -> HeaderIter<'a> {
        HeaderIter::new(self.headers_bytes())
    }

    /// Iterates the trailers.
    #[must_use]
    pub fn trailers(&self) -> HeaderIter<'a> {
        HeaderIter::new(&self.bytes[self.headers_end..self.trailers_end])
    }

    /// Returns the encoded trailers array.
    #[must_use]
    pub fn trailers_bytes(&self) -> &'a [u8] {
        &self.bytes[self.headers_end..self.trailers_end]
    }

    /// Returns the position of the trailers array within the entry.
    #[must_use]
    pub fn trailers_at(&self) -> usize {
        self.headers_end
    }
}

/// A header read from an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef<'a> {
    /// Header name.
    pub name: &'a [u8],
    /// Header value, `None` for a null value.
    pub value: Option<&'a [u8]>,
    encoded: &'a [u8],
}

impl<'a> HeaderRef<'a> {
    /// Returns the encoded header item.
    #[must_use]
    pub fn encoded(&self) -> &'a [u8] {
        self.encoded
    }
}

/// Iterator over the items of a headers or trailers array.
#[derive(Debug, Clone)]
pub struct HeaderIter<'a> {
    items: &'a [u8],
    at: usize,
    remaining: usize,
}

impl<'a> HeaderIter<'a> {
    fn new(array: &'a [u8]) -> Self {
        let count = get_i32(array, 4).and_then(|c| usize::try_from(c).ok());
        Self {
            items: array.get(SIZEOF_EMPTY_ARRAY..).unwrap_or_default(),
            at: 0,
            remaining: count.unwrap_or(0),
        }
    }
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = HeaderRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let start = self.at;
        let (name, name_end) = get_octets(self.items, start)?;
        let (value, end) = get_octets(self.items, name_end)?;
        self.at = end;
        self.remaining -= 1;
        Some(HeaderRef {
            name: name.unwrap_or_default(),
            value,
            encoded: &self.items[start..end],
        })
    }
}

/// An entry copied out of a log file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryBuf {
    bytes: Vec<u8>,
    position: u32,
    key_end: usize,
    value_end: usize,
    headers_end: usize,
    trailers_end: usize,
}

impl EntryBuf {
    /// Copies `entry`.
    #[must_use]
    pub fn copy_of(entry: &CacheEntry<'_>) -> Self {
        Self {
            bytes: entry.bytes.to_vec(),
            position: entry.position,
            key_end: entry.key_end,
            value_end: entry.value_end,
            headers_end: entry.headers_end,
            trailers_end: entry.trailers_end,
        }
    }

    /// Takes ownership of an encoded entry read from `position`.
    ///
    /// Returns `None` if `bytes` does not hold a complete entry.
    #[must_use]
    pub fn from_bytes(mut bytes: Vec<u8>, position: u32) -> Option<Self> {
        let (key_end, value_end, headers_end, trailers_end, sizeof) = {
            let entry = CacheEntry::try_wrap(&bytes, position)?;
            (
                entry.key_end,
                entry.value_end,
                entry.headers_end,
                entry.trailers_end,
                entry.sizeof(),
            )
        };
        bytes.truncate(sizeof);
        Some(Self {
            bytes,
            position,
            key_end,
            value_end,
            headers_end,
            trailers_end,
        })
    }

    /// Overwrites the ancestor offset of the copy.
    pub fn set_ancestor(&mut self, ancestor: i64) {
        self.bytes[FIELD_OFFSET_ANCESTOR..FIELD_OFFSET_DESCENDANT]
            .copy_from_slice(&ancestor.to_be_bytes());
    }

    /// Returns the encoded entry.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns a view of the copied entry.
    #[must_use]
    pub fn entry(&self) -> CacheEntry<'_> {
        CacheEntry {
            bytes: &self.bytes,
            position: self.position,
            key_end: self.key_end,
            value_end: self.value_end,
            headers_end: self.headers_end,
            trailers_end: self.trailers_end,
        }
    }
}

/// Builds a complete entry in memory.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct EntryWriter {
    bytes: Vec<u8>,
}

#[cfg(test)]
impl EntryWriter {
    pub(crate) fn header(
        offset: i64,
        timestamp: i64,
        owner_id: i64,
        ancestor: i64,
        flags: EntryFlags,
        delta_position: i32,
    ) -> Self {
        let header = EntryHeader {
            offset,
            timestamp,
            owner_id,
            ancestor,
            flags,
            delta_position,
            ..EntryHeader::default()
        };
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(&header.encode());
        Self { bytes }
    }

    pub(crate) fn key(mut self, key: Option<&[u8]>) -> Self {
        put_octets(&mut self.bytes, key);
        self
    }

    pub(crate) fn value(mut self, value: Option<&[u8]>) -> Self {
        put_octets(&mut self.bytes, value);
        self
    }

    pub(crate) fn headers(mut self, headers: &[Header]) -> Self {
        self.bytes.extend_from_slice(&encode_headers(headers));
        self.bytes.extend_from_slice(&EMPTY_ARRAY);
        self.bytes.extend_from_slice(&0i32.to_be_bytes());
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        self.bytes
    }
}
