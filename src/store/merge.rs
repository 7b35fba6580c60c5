//! K-way merge over sorted segment entry streams.
//!
//! Combines several ascending [`SegmentEntry`] iterators into one globally
//! sorted stream. For equal keys the entry with the highest LSN wins and the
//! older versions are swallowed; the resolved stream optionally drops
//! tombstones, yielding the effective live view of a set of segments.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::segment::SegmentEntry;

struct HeapItem {
    entry: SegmentEntry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest key pops first.
        // Ties pop highest-LSN first so version resolution sees the winner
        // before the entries it supersedes.
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| self.entry.lsn.cmp(&other.entry.lsn))
    }
}

/// Merges ascending entry streams into one ascending stream with exactly one
/// entry per key (the highest-LSN version).
pub struct MergedEntries<'a> {
    heap: BinaryHeap<HeapItem>,
    sources: Vec<Box<dyn Iterator<Item = SegmentEntry> + 'a>>,
}

impl<'a> MergedEntries<'a> {
    /// Builds the merge from the given streams. Each must be ascending by
    /// key with at most one entry per key.
    pub fn new(mut sources: Vec<Box<dyn Iterator<Item = SegmentEntry> + 'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(entry) = iter.next() {
                heap.push(HeapItem { entry, source });
            }
        }
        Self { heap, sources }
    }

    fn refill(&mut self, source: usize) {
        if let Some(entry) = self.sources[source].next() {
            self.heap.push(HeapItem { entry, source });
        }
    }
}

impl Iterator for MergedEntries<'_> {
    type Item = SegmentEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let HeapItem { entry, source } = self.heap.pop()?;
        self.refill(source);

        // Swallow older versions of the same key.
        while let Some(top) = self.heap.peek() {
            if top.entry.key != entry.key {
                break;
            }
            let source = top.source;
            self.heap.pop();
            self.refill(source);
        }

        Some(entry)
    }
}

/// The effective live view: merged entries with tombstones dropped.
pub struct LiveEntries<'a> {
    inner: MergedEntries<'a>,
}

impl<'a> LiveEntries<'a> {
    /// Wraps a [`MergedEntries`] stream, hiding deleted keys.
    pub fn new(inner: MergedEntries<'a>) -> Self {
        Self { inner }
    }
}

impl Iterator for LiveEntries<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.inner.by_ref() {
            if let Some(value) = entry.value {
                return Some((entry.key, value));
            }
        }
        None
    }
}
