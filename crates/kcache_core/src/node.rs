//! The ordered list of a partition's segments.
//!
//! Nodes live in a slot arena linked by index, with slot 0 as a permanent
//! sentinel: the list is circular through it, so "before first" and "after
//! last" are both the sentinel. Removing a node bumps its slot generation,
//! which invalidates every [`NodeId`] still pointing at it.

use crate::segment::Segment;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

const SENTINEL: u32 = 0;

/// Handle to a node. Stale once the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Returns `true` for the sentinel.
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.index == SENTINEL
    }
}

#[derive(Debug)]
struct Node {
    segment: Option<Arc<Segment>>,
    previous: u32,
    next: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of segment nodes in base-offset order.
#[derive(Debug)]
pub struct NodeList {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Default for NodeList {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeList {
    /// Creates a list holding only the sentinel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(Node {
                    segment: None,
                    previous: SENTINEL,
                    next: SENTINEL,
                }),
            }],
            free: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn id_of(&self, index: u32) -> NodeId {
        NodeId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn link(&self, index: u32) -> &Node {
        // links always point at occupied slots
        match self.slots[index as usize].node.as_ref() {
            Some(node) => node,
            None => unreachable!("dangling node link {index}"),
        }
    }

    fn link_mut(&mut self, index: u32) -> &mut Node {
        match self.slots[index as usize].node.as_mut() {
            Some(node) => node,
            None => unreachable!("dangling node link {index}"),
        }
    }

    /// Returns the sentinel.
    #[must_use]
    pub fn sentinel(&self) -> NodeId {
        self.id_of(SENTINEL)
    }

    /// Returns the first node, or the sentinel if empty.
    #[must_use]
    pub fn first(&self) -> NodeId {
        self.id_of(self.link(SENTINEL).next)
    }

    /// Returns the last node (the appendable head), or the sentinel if empty.
    #[must_use]
    pub fn head(&self) -> NodeId {
        self.id_of(self.link(SENTINEL).previous)
    }

    /// Returns `true` if `id` still refers to a node.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Returns the node's segment. The sentinel and stale ids have none.
    #[must_use]
    pub fn segment(&self, id: NodeId) -> Option<Arc<Segment>> {
        self.node(id).and_then(|node| node.segment.clone())
    }

    /// Returns the node after `id`, or `None` if `id` is stale.
    #[must_use]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).map(|node| self.id_of(node.next))
    }

    /// Returns the node before `id`, or `None` if `id` is stale.
    #[must_use]
    pub fn previous(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).map(|node| self.id_of(node.previous))
    }

    /// Returns the first node whose base offset is above `base_offset`, or
    /// the sentinel.
    #[must_use]
    pub fn next_after(&self, base_offset: i64) -> NodeId {
        self.iter()
            .find(|(_, segment)| segment.base_offset() > base_offset)
            .map_or_else(|| self.sentinel(), |(id, _)| id)
    }

    /// Appends a node after the current head.
    pub fn push_back(&mut self, segment: Arc<Segment>) -> NodeId {
        let previous = self.link(SENTINEL).previous;
        let node = Node {
            segment: Some(segment),
            previous,
            next: SENTINEL,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.link_mut(previous).next = index;
        self.link_mut(SENTINEL).previous = index;
        self.id_of(index)
    }

    /// Unlinks a node and returns its segment. The sentinel cannot be
    /// removed.
    pub fn remove(&mut self, id: NodeId) -> Option<Arc<Segment>> {
        if id.is_sentinel() || !self.contains(id) {
            return None;
        }
        let slot = &mut self.slots[id.index as usize];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        self.link_mut(node.previous).next = node.next;
        self.link_mut(node.next).previous = node.previous;
        node.segment
    }

    /// Swaps the node's segment, returning the old one.
    pub fn replace(&mut self, id: NodeId, segment: Arc<Segment>) -> Option<Arc<Segment>> {
        if id.is_sentinel() {
            return None;
        }
        self.node_mut(id)?.segment.replace(segment)
    }

    /// Returns the first node whose base offset is not below `offset`, or the
    /// sentinel.
    #[must_use]
    pub fn seek_not_before(&self, offset: i64) -> NodeId {
        self.iter()
            .find(|(_, segment)| segment.base_offset() >= offset)
            .map_or_else(|| self.sentinel(), |(id, _)| id)
    }

    /// Returns the last node whose base offset is not above `offset`, or the
    /// sentinel.
    #[must_use]
    pub fn seek_not_after(&self, offset: i64) -> NodeId {
        let mut index = self.link(SENTINEL).previous;
        while index != SENTINEL {
            let node = self.link(index);
            match &node.segment {
                Some(segment) if segment.base_offset() > offset => index = node.previous,
                _ => break,
            }
        }
        self.id_of(index)
    }

    /// Walks backward from `id` to the first node whose base offset is not
    /// above `base_offset`, or the sentinel.
    #[must_use]
    pub fn seek_ancestor(&self, id: NodeId, base_offset: i64) -> NodeId {
        if !self.contains(id) {
            return self.seek_not_after(base_offset);
        }
        let mut index = id.index;
        while index != SENTINEL {
            let node = self.link(index);
            match &node.segment {
                Some(segment) if segment.base_offset() > base_offset => index = node.previous,
                _ => break,
            }
        }
        self.id_of(index)
    }

    /// Iterates nodes and segments from first to last.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Arc<Segment>)> + '_ {
        let mut index = self.link(SENTINEL).next;
        std::iter::from_fn(move || {
            if index == SENTINEL {
                return None;
            }
            let node = self.link(index);
            let id = self.id_of(index);
            index = node.next;
            node.segment.as_ref().map(|segment| (id, segment))
        })
    }

    /// Returns the number of nodes, excluding the sentinel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - 1 - self.free.len()
    }

    /// Returns `true` if the list holds only the sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Describes a node.
    #[must_use]
    pub fn describe(&self, id: NodeId) -> NodeDescription {
        NodeDescription {
            base_offset: if id.is_sentinel() {
                None
            } else {
                self.segment(id).map(|segment| segment.base_offset())
            },
        }
    }
}

/// Display form of a node: `[Node] <base offset>` or `[Node] sentinel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescription {
    base_offset: Option<i64>,
}

impl fmt::Display for NodeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base_offset {
            Some(base_offset) => write!(f, "[Node] {base_offset}"),
            None => f.write_str("[Node] sentinel"),
        }
    }
}

/// A shareable handle to a partition's node list, used by cursors.
#[derive(Debug, Clone, Default)]
pub struct PartitionNodes {
    inner: Arc<RwLock<NodeList>>,
}

impl PartitionNodes {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with shared access to the list.
    pub fn read<T>(&self, f: impl FnOnce(&NodeList) -> T) -> T {
        f(&self.inner.read())
    }

    /// Runs `f` with exclusive access to the list.
    pub fn write<T>(&self, f: impl FnOnce(&mut NodeList) -> T) -> T {
        f(&mut self.inner.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use tempfile::{tempdir, TempDir};

    fn list(bases: &[i64]) -> (TempDir, NodeList, Vec<NodeId>) {
        let dir = tempdir().unwrap();
        let config = TopicConfig::new().segment_bytes(1024).segment_index_bytes(256);
        let mut nodes = NodeList::new();
        let ids = bases
            .iter()
            .map(|base| nodes.push_back(Segment::create(dir.path(), "test", 0, *base, &config).unwrap()))
            .collect();
        (dir, nodes, ids)
    }

    #[test]
    fn empty_list_is_sentinel() {
        let nodes = NodeList::new();
        assert!(nodes.is_empty());
        assert!(nodes.head().is_sentinel());
        assert!(nodes.first().is_sentinel());
        assert_eq!(nodes.describe(nodes.sentinel()).to_string(), "[Node] sentinel");
    }

    #[test]
    fn push_links_in_order() {
        let (_dir, nodes, ids) = list(&[10, 20, 30]);

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes.first(), ids[0]);
        assert_eq!(nodes.head(), ids[2]);
        assert_eq!(nodes.next(ids[0]), Some(ids[1]));
        assert_eq!(nodes.previous(ids[0]), Some(nodes.sentinel()));
        assert!(nodes.next(ids[2]).unwrap().is_sentinel());
        assert_eq!(nodes.describe(ids[0]).to_string(), "[Node] 10");
    }

    #[test]
    fn seek_not_after() {
        let (_dir, nodes, _) = list(&[10, 20, 30]);

        assert!(nodes.seek_not_after(5).is_sentinel());
        assert_eq!(nodes.segment(nodes.seek_not_after(10)).unwrap().base_offset(), 10);
        assert_eq!(nodes.segment(nodes.seek_not_after(15)).unwrap().base_offset(), 10);
    }

    #[test]
    fn seek_not_before() {
        let (_dir, nodes, _) = list(&[10, 20, 30]);

        assert!(nodes.seek_not_before(35).is_sentinel());
        assert_eq!(nodes.segment(nodes.seek_not_before(10)).unwrap().base_offset(), 10);
        assert_eq!(nodes.segment(nodes.seek_not_before(15)).unwrap().base_offset(), 20);
    }

    #[test]
    fn remove_relinks_neighbours() {
        let (_dir, mut nodes, ids) = list(&[10, 20, 30]);

        let removed = nodes.remove(ids[1]).unwrap();
        assert_eq!(removed.base_offset(), 20);
        assert_eq!(nodes.previous(ids[2]), Some(ids[0]));
        assert_eq!(nodes.next(ids[0]), Some(ids[2]));
        assert!(!nodes.contains(ids[1]));
        assert_eq!(nodes.next(ids[1]), None);
        assert!(nodes.remove(nodes.sentinel()).is_none());
    }

    #[test]
    fn stale_ids_do_not_alias_reused_slots() {
        let (dir, mut nodes, ids) = list(&[10, 20]);
        let config = TopicConfig::new().segment_bytes(1024).segment_index_bytes(256);

        nodes.remove(ids[0]);
        let reused = nodes.push_back(Segment::create(dir.path(), "test", 0, 40, &config).unwrap());

        assert_ne!(reused, ids[0]);
        assert!(nodes.segment(ids[0]).is_none());
        assert_eq!(nodes.segment(reused).unwrap().base_offset(), 40);
        assert_eq!(nodes.next_after(20), reused);
    }

    #[test]
    fn seek_ancestor_walks_backward() {
        let (_dir, nodes, ids) = list(&[10, 15]);

        assert_eq!(nodes.seek_ancestor(ids[1], 10), ids[0]);
        assert_eq!(nodes.seek_ancestor(ids[1], 15), ids[1]);
        assert!(nodes.seek_ancestor(ids[1], 5).is_sentinel());
    }
}
