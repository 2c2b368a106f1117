use crate::llrb::node::{Node, NodePtr};
use crate::llrb::tree;
use crate::llrb::writer::TreeShared;
use crate::{Entry, Incl};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Entries fetched from the tree per refill.
const BATCH_LIMIT: usize = 100;
const POOL_CAP: usize = 8;

/// Batching cursor over a pinned tree root. Tombstones are yielded;
/// callers that want live entries filter on `deleted`.
pub struct TreeIter {
    shared: Arc<TreeShared>,
    root: NodePtr,
    registered: bool,
    batch: Vec<Entry>,
    next: usize,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    incl: Incl,
    reverse: bool,
    drained: bool,
}

unsafe impl Send for TreeIter {}

impl TreeIter {
    pub(crate) fn new(
        shared: Arc<TreeShared>,
        lo: Option<Vec<u8>>,
        hi: Option<Vec<u8>>,
        incl: Incl,
        reverse: bool,
    ) -> TreeIter {
        let registered = shared.register_reader();
        let root = if registered {
            shared.root.load(Ordering::Acquire)
        } else {
            std::ptr::null_mut()
        };
        let batch = shared
            .iterpool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BATCH_LIMIT));
        TreeIter {
            shared,
            root,
            registered,
            batch,
            next: 0,
            lo,
            hi,
            incl,
            reverse,
            drained: !registered,
        }
    }

    /// A cursor that yields nothing, for provably empty ranges.
    pub(crate) fn empty(shared: Arc<TreeShared>) -> TreeIter {
        TreeIter {
            shared,
            root: std::ptr::null_mut(),
            registered: false,
            batch: Vec::new(),
            next: 0,
            lo: None,
            hi: None,
            incl: Incl::Both,
            reverse: false,
            drained: true,
        }
    }

    fn refill(&mut self) {
        self.batch.clear();
        self.next = 0;
        let batch = &mut self.batch;
        let mut callb = |nd: &Node| {
            batch.push(unsafe { nd.entry() });
            batch.len() < BATCH_LIMIT
        };
        unsafe {
            tree::dispatch_walk(
                self.root,
                self.lo.as_deref(),
                self.hi.as_deref(),
                self.incl,
                self.reverse,
                &mut callb,
            )
        };
        if self.batch.len() < BATCH_LIMIT {
            // the walk ran to completion
            self.drained = true;
        }
        // resume past the last key handed out
        if let Some(last) = self.batch.last() {
            if self.reverse {
                self.hi = Some(last.key.clone());
                self.incl = match self.incl {
                    Incl::Both => Incl::Low,
                    Incl::High => Incl::None,
                    other => other,
                };
            } else {
                self.lo = Some(last.key.clone());
                self.incl = match self.incl {
                    Incl::Both => Incl::High,
                    Incl::Low => Incl::None,
                    other => other,
                };
            }
        }
    }
}

impl Iterator for TreeIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            if self.next < self.batch.len() {
                let entry = std::mem::replace(
                    &mut self.batch[self.next],
                    Entry::tombstone(Vec::new(), 0),
                );
                self.next += 1;
                return Some(entry);
            }
            if self.drained {
                return None;
            }
            self.refill();
            if self.batch.is_empty() {
                self.drained = true;
                return None;
            }
        }
    }
}

impl Drop for TreeIter {
    fn drop(&mut self) {
        if self.registered {
            self.shared.unregister_reader();
        }
        let mut pool = self.shared.iterpool.lock().unwrap();
        if pool.len() < POOL_CAP {
            self.batch.clear();
            pool.push(std::mem::take(&mut self.batch));
        }
    }
}
