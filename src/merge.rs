use crate::Entry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type EntrySource = Box<dyn Iterator<Item = Entry> + Send>;

struct HeapItem {
    entry: Entry,
    src: usize,
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
    /// `BinaryHeap` pops the greatest item, so smaller keys compare
    /// greater; on equal keys the lower source index (the newer tier)
    /// wins.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| other.src.cmp(&self.src))
    }
}

/// K-way merge over sorted, key-unique sources ordered newest first.
/// Each key is yielded once, from the newest source holding it;
/// tombstones pass through for the caller to filter.
pub struct MergeIter {
    sources: Vec<EntrySource>,
    heap: BinaryHeap<HeapItem>,
}

impl MergeIter {
    pub fn new(mut sources: Vec<EntrySource>) -> MergeIter {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (src, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(HeapItem { entry, src });
            }
        }
        MergeIter { sources, heap }
    }

    fn refill(&mut self, src: usize) {
        if let Some(entry) = self.sources[src].next() {
            self.heap.push(HeapItem { entry, src });
        }
    }
}

impl Iterator for MergeIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let top = self.heap.pop()?;
        self.refill(top.src);
        // skip the same key surfacing from older tiers
        while let Some(peek) = self.heap.peek() {
            if peek.entry.key != top.entry.key {
                break;
            }
            let dup = self.heap.pop().unwrap();
            self.refill(dup.src);
        }
        Some(top.entry)
    }
}
