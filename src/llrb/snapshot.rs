use crate::llrb::node::NodePtr;
use crate::llrb::tree::{self, Reclaim};
use crate::llrb::TreeStats;
use crate::Entry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// An immutable view of the tree captured at a writer quiesce point. The
/// reclaim list holds everything that became garbage between the previous
/// capture and this one; those blocks stay pinned until this snapshot has
/// refcount zero AND is the oldest one alive.
pub struct TreeSnapshot {
    id: u64,
    root: NodePtr,
    stats: TreeStats,
    reclaim: Mutex<Vec<Reclaim>>,
    refcount: AtomicI64,
}

unsafe impl Send for TreeSnapshot {}
unsafe impl Sync for TreeSnapshot {}

impl TreeSnapshot {
    pub(crate) fn new(id: u64, root: NodePtr, stats: TreeStats, reclaim: Vec<Reclaim>) -> Self {
        TreeSnapshot {
            id,
            root,
            stats,
            reclaim: Mutex::new(reclaim),
            refcount: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Point lookup against this snapshot's root. Only sound while the
    /// caller holds a reference on the snapshot: head-first purge ordering
    /// keeps every node reachable from this root alive until then.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        debug_assert!(self.refcount() > 0);
        let nd = unsafe { tree::get_node(self.root, key) };
        if nd.is_null() {
            None
        } else {
            Some(unsafe { (*nd).entry() })
        }
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    pub fn count(&self) -> i64 {
        self.stats.n_count
    }

    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn refer(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let count = self.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(count >= 0, "tree snapshot refcount went negative");
    }

    pub(crate) fn take_reclaim(&self) -> Vec<Reclaim> {
        std::mem::take(&mut *self.reclaim.lock().unwrap())
    }
}
