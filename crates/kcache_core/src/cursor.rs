//! Filtered reads over a partition's segments.
//!
//! A cursor holds one acquired segment at a time and asks its condition for
//! candidate positions, crossing to the next node when the condition is
//! exhausted for the segment:
//!
//! ```text
//! init(node, offset) --> reset --> next ---- RETRY ----------> None (no data yet)
//!                                   |  \---- NEXT_SEGMENT --> acquire next node, reset
//!                                   |
//!                                   +-- read entry, test --> miss: position + 1
//!                                                        \-> hit: peeked until advance
//! ```
//!
//! `next` returns the same entry until [`Cursor::advance`] moves past it.
//! Cursors read through [`PartitionNodes`] on every call, so the writer can
//! append, freeze and compact segments while cursors are open.
//!
//! ## Invariants
//!
//! - A cursor holds at most one segment reference, released by
//!   [`Cursor::close`] or on drop
//! - With a delta type other than [`DeltaType::None`], an entry whose
//!   ancestor was returned by this cursor comes back with its patch in place
//!   of its value; any other entry comes back whole, ancestor cleared

use crate::delta::read_delta_record;
use crate::entry::{CacheEntry, EntryBuf, NO_ANCESTOR_OFFSET, NO_DELTA_POSITION};
use crate::error::CacheResult;
use crate::filter::{is_sentinel, Condition};
use crate::node::{NodeId, NodeList, PartitionNodes};
use crate::segment::{Segment, SegmentRef};
use crate::types::DeltaType;
use kcache_storage::{NEXT_SEGMENT_VALUE, RETRY_SEGMENT_VALUE};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
struct Peeked {
    position: i32,
    entry: EntryBuf,
    filters: u64,
}

/// A positioned, filtered iterator over one partition.
#[derive(Debug)]
pub struct Cursor {
    condition: Condition,
    delta_type: DeltaType,
    delta_key_offsets: HashSet<i64>,
    node: Option<NodeId>,
    segment: Option<SegmentRef>,
    filters: u64,
    offset: i64,
    latest_offset: i64,
    position: i32,
    peeked: Option<Peeked>,
}

impl Cursor {
    pub(crate) fn new(condition: Condition, delta_type: DeltaType) -> Self {
        Self {
            condition,
            delta_type,
            delta_key_offsets: HashSet::new(),
            node: None,
            segment: None,
            filters: 0,
            offset: 0,
            latest_offset: 0,
            position: 0,
            peeked: None,
        }
    }

    /// Positions the cursor at `offset`, starting from `node`.
    ///
    /// Nodes whose segment has already closed are skipped. If no segment
    /// can be acquired, [`next`](Self::next) retries from `node` later.
    pub fn init(&mut self, nodes: &PartitionNodes, node: NodeId, offset: i64, latest_offset: i64) {
        self.close();
        self.offset = offset;
        self.latest_offset = latest_offset;
        self.filters = 0;
        self.delta_key_offsets.clear();
        self.node = Some(node);
        self.attach_from(nodes, node);
    }

    /// Returns the next matching entry, or `None` when nothing matches yet.
    ///
    /// The entry is returned again by later calls until
    /// [`advance`](Self::advance) moves past it.
    pub fn next(&mut self, nodes: &PartitionNodes) -> Option<EntryBuf> {
        if let Some(peeked) = self.peeked.as_ref().filter(|p| p.position == self.position) {
            self.filters = peeked.filters;
            return Some(peeked.entry.clone());
        }

        if self.segment.is_none() {
            let start = self.node?;
            if !self.attach_from(nodes, start) {
                return None;
            }
        }

        loop {
            let segment = Arc::clone(self.segment.as_ref()?.arc());
            let position_next = self.condition.next(&segment, self.position);
            match position_next {
                RETRY_SEGMENT_VALUE => return None,
                NEXT_SEGMENT_VALUE => {
                    if !self.next_segment(nodes, &segment) {
                        return None;
                    }
                    continue;
                }
                _ => {}
            }

            let at = position_next as u32;
            let entry = segment.log_file().read_bytes(at, |bytes| {
                CacheEntry::try_wrap(bytes, at).map(|entry| EntryBuf::copy_of(&entry))
            })?;

            let next_offset = entry.entry().offset();
            self.filters = if next_offset < self.offset {
                0
            } else {
                self.condition.test(&entry.entry())
            };

            if self.filters == 0 {
                self.offset = self.offset.max(next_offset);
                self.position = position_next + 1;
                continue;
            }

            let entry = match self.delta_type {
                DeltaType::None => entry,
                DeltaType::JsonPatch => self.mark_ancestor_if_necessary(&segment, entry),
            };
            self.position = position_next;
            self.peeked = Some(Peeked {
                position: position_next,
                entry: entry.clone(),
                filters: self.filters,
            });
            return Some(entry);
        }
    }

    /// Moves past the last returned entry to `offset`, following the node
    /// to its new segment if the writer froze or compacted it.
    pub fn advance(&mut self, nodes: &PartitionNodes, offset: i64) {
        self.offset = offset;
        self.position = self.position.saturating_add(1);
        self.peeked = None;

        let Some(held) = self.segment.as_ref().map(|s| Arc::clone(s.arc())) else {
            return;
        };
        let node = self.node;
        let current = nodes.read(|list| node.and_then(|n| list.segment(n)));
        if current.is_some_and(|c| Arc::ptr_eq(&c, &held)) {
            return;
        }

        let moved = nodes.read(|list| {
            let start = match node.filter(|n| list.contains(*n)) {
                Some(node) => node,
                None => list.next_after(held.base_offset()),
            };
            acquire_from(list, start)
        });
        if let Some((node, segment)) = moved {
            self.attach(node, segment);
        }
    }

    /// Flags `entry`, returned by this cursor, dirty in its segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn mark_entry_dirty(&self, nodes: &PartitionNodes, entry: &CacheEntry<'_>) -> CacheResult<()> {
        let Some(held) = self.segment.as_ref() else {
            return Ok(());
        };
        let node = self.node;
        let current = nodes.read(|list| node.and_then(|n| list.segment(n)));
        // A frozen replacement of an appendable segment shares its log layout.
        match current {
            Some(current) if current.is_frozen() && !held.is_frozen() => current.mark_dirty(entry),
            _ => held.mark_dirty(entry),
        }
    }

    /// Returns the match mask of the last returned entry.
    #[must_use]
    pub fn filters(&self) -> u64 {
        self.filters
    }

    /// Returns the offset the cursor reads from.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Returns the latest offset given to [`init`](Self::init).
    #[must_use]
    pub fn latest_offset(&self) -> i64 {
        self.latest_offset
    }

    /// Returns the node of the held segment.
    #[must_use]
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Returns the held segment.
    #[must_use]
    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_deref()
    }

    /// Releases the held segment. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(segment) = self.segment.take() {
            trace!(segment = %segment.arc(), "cursor released segment");
        }
        self.peeked = None;
    }

    fn attach_from(&mut self, nodes: &PartitionNodes, node: NodeId) -> bool {
        let offset = self.offset;
        let acquired = nodes.read(|list| {
            let start = if node.is_sentinel() {
                list.first()
            } else if list.contains(node) {
                node
            } else {
                match list.seek_not_after(offset) {
                    found if found.is_sentinel() => list.first(),
                    found => found,
                }
            };
            acquire_from(list, start)
        });
        match acquired {
            Some((node, segment)) => {
                self.attach(node, segment);
                true
            }
            None => false,
        }
    }

    fn next_segment(&mut self, nodes: &PartitionNodes, current: &Segment) -> bool {
        let node = self.node;
        let moved = nodes.read(|list| {
            let next = match node.and_then(|n| list.next(n)) {
                Some(next) => next,
                None => list.next_after(current.base_offset()),
            };
            acquire_from(list, next)
        });
        match moved {
            Some((node, segment)) => {
                self.attach(node, segment);
                true
            }
            None => false,
        }
    }

    fn attach(&mut self, node: NodeId, segment: SegmentRef) {
        let position = self.condition.reset(&segment, self.offset, None);
        self.position = if is_sentinel(position) { 0 } else { position };
        debug!(segment = %segment.arc(), position = self.position, "cursor attached");
        self.node = Some(node);
        self.segment = Some(segment);
        self.peeked = None;
    }

    fn mark_ancestor_if_necessary(&mut self, segment: &Segment, mut entry: EntryBuf) -> EntryBuf {
        let view = entry.entry();
        let ancestor = view.ancestor();
        let offset = view.offset();

        if view.is_tombstone() {
            self.delta_key_offsets.remove(&ancestor);
            return entry;
        }

        if ancestor != NO_ANCESTOR_OFFSET {
            let delta_position = view.delta_position();
            let spliced = (delta_position != NO_DELTA_POSITION
                && self.delta_key_offsets.remove(&ancestor))
            .then(|| read_delta_record(segment.delta_file(), delta_position as u32))
            .flatten()
            .and_then(|delta| splice_delta(&view, &delta));

            match spliced {
                Some(spliced) => entry = spliced,
                None => entry.set_ancestor(NO_ANCESTOR_OFFSET),
            }
        }

        self.delta_key_offsets.insert(offset);
        entry
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor[offset {}, position {:08x}, ", self.offset, self.position)?;
        match &self.segment {
            Some(segment) => write!(f, "{}]", segment.arc()),
            None => write!(f, "detached]"),
        }
    }
}

fn acquire_from(list: &NodeList, mut node: NodeId) -> Option<(NodeId, SegmentRef)> {
    loop {
        if node.is_sentinel() {
            return None;
        }
        if let Some(segment) = list.segment(node).and_then(|s| s.acquire()) {
            return Some((node, segment));
        }
        node = list.next(node)?;
    }
}

/// Rebuilds `entry` with the delta record in place of its value.
fn splice_delta(entry: &CacheEntry<'_>, delta: &[u8]) -> Option<EntryBuf> {
    let prefix = &entry.as_bytes()[..entry.key_end()];
    let headers = entry.headers_bytes();
    let trailers = entry.trailers_bytes();
    let mut bytes = Vec::with_capacity(prefix.len() + delta.len() + headers.len() + trailers.len() + 4);
    bytes.extend_from_slice(prefix);
    bytes.extend_from_slice(delta);
    bytes.extend_from_slice(headers);
    bytes.extend_from_slice(trailers);
    bytes.extend_from_slice(&0i32.to_be_bytes());
    EntryBuf::from_bytes(bytes, entry.position())
}
