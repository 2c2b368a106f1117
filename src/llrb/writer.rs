use crate::clock::ScalarClock;
use crate::error::Error;
use crate::llrb::node::{Node, NodePtr};
use crate::llrb::snapshot::TreeSnapshot;
use crate::llrb::tree::{self, TreeCore};
use crate::llrb::{TreeIter, TreeStats};
use crate::{Entry, Incl, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct TreeOptions {
    pub name: String,
    /// Deletes write tombstones instead of unlinking nodes.
    pub lsm: bool,
    /// Run the background snapshot ticker; without it snapshots are
    /// captured at quiesce points on demand.
    pub mvcc: bool,
    pub snapshot_tick: Duration,
    pub key_capacity: usize,
    pub val_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> TreeOptions {
        TreeOptions {
            name: "llrb".to_string(),
            lsm: false,
            mvcc: true,
            snapshot_tick: Duration::from_millis(4),
            key_capacity: 64 * 1024 * 1024,
            val_capacity: 64 * 1024 * 1024,
        }
    }
}

/// State shared between the writer thread and lock-free readers.
pub(crate) struct TreeShared {
    pub(crate) name: String,
    pub(crate) lsm: bool,
    pub(crate) root: AtomicPtr<Node>,
    pub(crate) seqno: AtomicU64,
    pub(crate) n_count: AtomicI64,
    pub(crate) footprint: AtomicUsize,
    pub(crate) n_readers: AtomicI64,
    pub(crate) closed: AtomicBool,
    pub(crate) snaplist: Mutex<VecDeque<Arc<TreeSnapshot>>>,
    pub(crate) iterpool: Mutex<Vec<Vec<Entry>>>,
    snapid: ScalarClock,
}

impl TreeShared {
    /// Register a raw reader; purge defers while any is active. Fails
    /// once the tree is closed.
    pub(crate) fn reader(&self) -> Option<ReaderGuard<'_>> {
        self.n_readers.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.n_readers.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ReaderGuard { shared: self })
    }

    /// Same, detached from a borrow so iterators can own it.
    pub(crate) fn register_reader(self: &Arc<Self>) -> bool {
        self.n_readers.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.n_readers.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn unregister_reader(&self) {
        self.n_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct ReaderGuard<'a> {
    shared: &'a TreeShared,
}

impl<'a> Drop for ReaderGuard<'a> {
    fn drop(&mut self) {
        self.shared.unregister_reader();
    }
}

enum Cmd {
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        resp: Sender<Result<(Option<Entry>, u64)>>,
    },
    SetCas {
        key: Vec<u8>,
        value: Vec<u8>,
        cas: u64,
        resp: Sender<Result<(Option<Entry>, u64)>>,
    },
    Delete {
        key: Vec<u8>,
        resp: Sender<Result<(Option<Entry>, u64)>>,
    },
    Snapshot {
        resp: Option<Sender<Arc<TreeSnapshot>>>,
    },
    Purge,
    Stats {
        resp: Sender<TreeStats>,
    },
    Validate {
        resp: Sender<Result<()>>,
    },
    Close {
        resp: Sender<()>,
    },
}

/// Handle to one memory tree. Writes serialize through the writer thread;
/// reads go straight to the published root.
pub struct Tree {
    shared: Arc<TreeShared>,
    tx: Sender<Cmd>,
    writer: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Tree {
    pub fn new(opts: TreeOptions) -> Result<Tree> {
        let core = TreeCore::new(opts.key_capacity, opts.val_capacity)?;
        let shared = Arc::new(TreeShared {
            name: opts.name.clone(),
            lsm: opts.lsm,
            root: AtomicPtr::new(std::ptr::null_mut()),
            seqno: AtomicU64::new(0),
            n_count: AtomicI64::new(0),
            footprint: AtomicUsize::new(0),
            n_readers: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            snaplist: Mutex::new(VecDeque::new()),
            iterpool: Mutex::new(Vec::new()),
            snapid: ScalarClock::new(0),
        });

        let (tx, rx) = unbounded();
        let wshared = shared.clone();
        let mvcc = opts.mvcc;
        let writer = thread::Builder::new()
            .name(format!("{}-writer", opts.name))
            .spawn(move || run_writer(core, wshared, rx, mvcc))?;

        let ticker = if opts.mvcc {
            let tshared = shared.clone();
            let ttx = tx.clone();
            let tick = opts.snapshot_tick;
            let handle = thread::Builder::new()
                .name(format!("{}-ticker", opts.name))
                .spawn(move || run_ticker(tshared, ttx, tick))?;
            Some(handle)
        } else {
            None
        };

        Ok(Tree {
            shared,
            tx,
            writer: Mutex::new(Some(writer)),
            ticker: Mutex::new(ticker),
        })
    }

    fn call<T>(&self, cmd: Cmd, rx: Receiver<Result<T>>) -> Result<T> {
        self.tx.send(cmd).map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    //---- write path

    /// Insert or update; returns the previous entry and the new cas.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(Option<Entry>, u64)> {
        let (resp, rx) = bounded(1);
        self.call(Cmd::Set { key, value, resp }, rx)
    }

    /// Compare-and-set against the entry's current cas; `cas == 0` means
    /// the key is expected to be absent.
    pub fn set_cas(&self, key: Vec<u8>, value: Vec<u8>, cas: u64) -> Result<(Option<Entry>, u64)> {
        let (resp, rx) = bounded(1);
        self.call(
            Cmd::SetCas {
                key,
                value,
                cas,
                resp,
            },
            rx,
        )
    }

    /// Remove a key. In lsm mode a tombstone is written unconditionally;
    /// otherwise an absent key fails with `KeyNotFound`.
    pub fn delete(&self, key: Vec<u8>) -> Result<(Option<Entry>, u64)> {
        let (resp, rx) = bounded(1);
        self.call(Cmd::Delete { key, resp }, rx)
    }

    //---- read path

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        let _guard = self.shared.reader()?;
        let root = self.shared.root.load(Ordering::Acquire);
        let nd = unsafe { tree::get_node(root, key) };
        if nd.is_null() {
            None
        } else {
            Some(unsafe { (*nd).entry() })
        }
    }

    /// Smallest live entry, tombstones skipped.
    pub fn min(&self) -> Option<Entry> {
        let _guard = self.shared.reader()?;
        let root = self.shared.root.load(Ordering::Acquire);
        let nd = unsafe { tree::min_live(root) };
        if nd.is_null() {
            None
        } else {
            Some(unsafe { (*nd).entry() })
        }
    }

    /// Largest live entry, tombstones skipped.
    pub fn max(&self) -> Option<Entry> {
        let _guard = self.shared.reader()?;
        let root = self.shared.root.load(Ordering::Acquire);
        let nd = unsafe { tree::max_live(root) };
        if nd.is_null() {
            None
        } else {
            Some(unsafe { (*nd).entry() })
        }
    }

    /// Visit entries in `[lo, hi]` per the inclusion flags; the callback
    /// returns false to stop. Tombstones are passed through.
    pub fn range_with<F>(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        incl: Incl,
        reverse: bool,
        mut callb: F,
    ) where
        F: FnMut(Entry) -> bool,
    {
        let incl = match fix_range_args(lo, hi, incl) {
            Some(incl) => incl,
            None => return,
        };
        let guard = self.shared.reader();
        if guard.is_none() {
            return;
        }
        let root = self.shared.root.load(Ordering::Acquire);
        let mut cb = |nd: &Node| callb(unsafe { nd.entry() });
        unsafe { tree::dispatch_walk(root, lo, hi, incl, reverse, &mut cb) };
    }

    /// Batching cursor over `[lo, hi]`. The cursor pins the root it was
    /// created from; later writes are not observed.
    pub fn iterate(
        &self,
        lo: Option<Vec<u8>>,
        hi: Option<Vec<u8>>,
        incl: Incl,
        reverse: bool,
    ) -> TreeIter {
        let incl = match fix_range_args(lo.as_deref(), hi.as_deref(), incl) {
            Some(incl) => incl,
            None => return TreeIter::empty(self.shared.clone()),
        };
        TreeIter::new(self.shared.clone(), lo, hi, incl, reverse)
    }

    /// Full scan, tombstones included.
    pub fn scan(&self) -> TreeIter {
        self.iterate(None, None, Incl::Both, false)
    }

    //---- snapshots and maintenance

    /// Capture a snapshot at the next quiesce point and return it,
    /// already referred; the caller releases it.
    pub fn make_snapshot(&self) -> Result<Arc<TreeSnapshot>> {
        let (resp, rx) = bounded(1);
        self.tx
            .send(Cmd::Snapshot { resp: Some(resp) })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    /// Ask the writer to reclaim drained snapshots.
    pub fn purge(&self) {
        let _ = self.tx.send(Cmd::Purge);
    }

    pub fn stats(&self) -> Result<TreeStats> {
        let (resp, rx) = bounded(1);
        self.tx
            .send(Cmd::Stats { resp })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    pub fn validate(&self) -> Result<()> {
        let (resp, rx) = bounded(1);
        self.call(Cmd::Validate { resp }, rx)
    }

    //---- accessors

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn count(&self) -> i64 {
        self.shared.n_count.load(Ordering::Relaxed)
    }

    /// Estimated memory footprint of keys, values and tree nodes.
    pub fn footprint(&self) -> usize {
        self.shared.footprint.load(Ordering::Relaxed)
    }

    pub fn seqno(&self) -> u64 {
        self.shared.seqno.load(Ordering::SeqCst)
    }

    /// Seed the seqno before the first write, typically from the newest
    /// disk level at recovery.
    pub fn set_seqno(&self, seqno: u64) {
        self.shared.seqno.store(seqno, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Shut the writer down after readers drain. Unflushed entries are
    /// dropped with the arenas. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        while self.shared.n_readers.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(10));
        }
        let (resp, rx) = bounded(1);
        if self.tx.send(Cmd::Close { resp }).is_ok() {
            let _ = rx.recv();
        }
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Close and release all memory; a memory tree has no disk presence.
    pub fn destroy(&self) -> Result<()> {
        self.close()
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Collapse degenerate ranges where both bounds name the same key; returns
/// None when the range is provably empty.
fn fix_range_args(lo: Option<&[u8]>, hi: Option<&[u8]>, incl: Incl) -> Option<Incl> {
    match (lo, hi) {
        (Some(lo), Some(hi)) if lo == hi => match incl {
            Incl::None => None,
            Incl::Low | Incl::High => Some(Incl::Both),
            Incl::Both => Some(Incl::Both),
        },
        _ => Some(incl),
    }
}

fn run_ticker(shared: Arc<TreeShared>, tx: Sender<Cmd>, tick: Duration) {
    debug!("{}: snapshot ticker start", shared.name);
    loop {
        thread::sleep(tick);
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        if tx.send(Cmd::Snapshot { resp: None }).is_err() {
            break;
        }
    }
    debug!("{}: snapshot ticker exit", shared.name);
}

fn run_writer(mut core: TreeCore, shared: Arc<TreeShared>, rx: Receiver<Cmd>, mvcc: bool) {
    info!("{}: writer thread start", shared.name);
    while let Ok(cmd) = rx.recv() {
        match cmd {
            Cmd::Set { key, value, resp } => {
                let _ = resp.send(do_set(&mut core, &shared, &key, &value));
            }
            Cmd::SetCas {
                key,
                value,
                cas,
                resp,
            } => {
                let res = (|| {
                    let root = shared.root.load(Ordering::Relaxed);
                    let nd = unsafe { tree::get_node(root, &key) };
                    let current = if nd.is_null() {
                        0
                    } else {
                        unsafe { (*nd).latest_seqno() }
                    };
                    if cas != current {
                        return Err(Error::InvalidCas);
                    }
                    do_set(&mut core, &shared, &key, &value)
                })();
                let _ = resp.send(res);
            }
            Cmd::Delete { key, resp } => {
                let _ = resp.send(do_delete(&mut core, &shared, &key));
            }
            Cmd::Snapshot { resp } => {
                let snap = capture_snapshot(&mut core, &shared);
                if let Some(resp) = resp {
                    // handed out already referred, the caller releases
                    snap.refer();
                    let _ = resp.send(snap);
                }
                try_purge(&mut core, &shared);
            }
            Cmd::Purge => {
                // without the ticker, reclaim batches move into a
                // snapshot here, at a quiesce point by construction
                if !mvcc && core.stats.n_reclaims > core.stats.n_frees {
                    capture_snapshot(&mut core, &shared);
                }
                try_purge(&mut core, &shared);
            }
            Cmd::Stats { resp } => {
                let _ = resp.send(core.stats.clone());
            }
            Cmd::Validate { resp } => {
                let root = shared.root.load(Ordering::Relaxed);
                let _ = resp.send(unsafe { tree::validate_tree(root, &core.stats) });
            }
            Cmd::Close { resp } => {
                let _ = resp.send(());
                break;
            }
        }
    }
    // snapshots hold pointers into the arenas; drop them before the core
    shared.snaplist.lock().unwrap().clear();
    info!("{}: writer thread exit", shared.name);
}

fn do_set(
    core: &mut TreeCore,
    shared: &TreeShared,
    key: &[u8],
    value: &[u8],
) -> Result<(Option<Entry>, u64)> {
    core.check_limits(key, value.len())?;
    let seqno = shared.seqno.fetch_add(1, Ordering::SeqCst) + 1;
    let root = shared.root.load(Ordering::Relaxed);
    let (root, old) = unsafe { core.upsert(root, key, value, seqno) };
    publish(core, shared, root);
    Ok((old, seqno))
}

fn do_delete(core: &mut TreeCore, shared: &TreeShared, key: &[u8]) -> Result<(Option<Entry>, u64)> {
    core.check_limits(key, 0)?;
    let root = shared.root.load(Ordering::Relaxed);
    if shared.lsm {
        let seqno = shared.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let (root, old) = unsafe { core.lsm_delete(root, key, seqno) };
        publish(core, shared, root);
        Ok((old, seqno))
    } else {
        if unsafe { tree::get_node(root, key) }.is_null() {
            return Err(Error::KeyNotFound);
        }
        let seqno = shared.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let (root, old) = unsafe { core.delete(root, key) };
        publish(core, shared, root);
        Ok((old, seqno))
    }
}

fn publish(core: &mut TreeCore, shared: &TreeShared, root: NodePtr) {
    shared.root.store(root, Ordering::Release);
    shared.n_count.store(core.stats.n_count, Ordering::Relaxed);
    shared
        .footprint
        .store(core.footprint(), Ordering::Relaxed);
}

fn capture_snapshot(core: &mut TreeCore, shared: &TreeShared) -> Arc<TreeSnapshot> {
    let id = shared.snapid.next();
    let root = shared.root.load(Ordering::Relaxed);
    let reclaim = core.take_reclaim();
    debug!(
        "{}: snapshot ${} born, {} blocks to reclaim",
        shared.name,
        id,
        reclaim.len()
    );
    let snap = Arc::new(TreeSnapshot::new(id, root, core.stats.clone(), reclaim));
    shared.snaplist.lock().unwrap().push_back(snap.clone());
    snap
}

/// Free reclaim lists of drained snapshots, oldest first. Deferred
/// entirely while any raw reader is registered; a snapshot that is not
/// the head is never reclaimed before the ones preceding it.
fn try_purge(core: &mut TreeCore, shared: &TreeShared) {
    if shared.n_readers.load(Ordering::SeqCst) != 0 {
        return;
    }
    let mut list = shared.snaplist.lock().unwrap();
    while let Some(front) = list.front() {
        if front.refcount() != 0 {
            break;
        }
        let snap = list.pop_front().unwrap();
        let items = snap.take_reclaim();
        if !items.is_empty() {
            debug!(
                "{}: snapshot ${} reclaimed, {} blocks freed",
                shared.name,
                snap.id(),
                items.len()
            );
        }
        core.free_reclaimed(items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree(name: &str, lsm: bool) -> Tree {
        Tree::new(TreeOptions {
            name: name.to_string(),
            lsm,
            mvcc: true,
            snapshot_tick: Duration::from_millis(2),
            key_capacity: 4 * 1024 * 1024,
            val_capacity: 4 * 1024 * 1024,
        })
        .unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let tree = small_tree("t-basic", false);
        let (old, cas1) = tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert!(old.is_none());
        assert_eq!(cas1, 1);
        let (old, _) = tree.set(b"a".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(old.unwrap().value, b"1".to_vec());

        let entry = tree.get(b"a").unwrap();
        assert_eq!(entry.value, b"2".to_vec());
        assert!(!entry.deleted);
        assert!(tree.get(b"b").is_none());

        let (old, _) = tree.delete(b"a".to_vec()).unwrap();
        assert_eq!(old.unwrap().value, b"2".to_vec());
        assert!(tree.get(b"a").is_none());
        assert!(matches!(
            tree.delete(b"a".to_vec()),
            Err(Error::KeyNotFound)
        ));
        tree.validate().unwrap();
    }

    #[test]
    fn test_lsm_delete_writes_tombstone() {
        let tree = small_tree("t-lsm", true);
        tree.set(b"x".to_vec(), b"1".to_vec()).unwrap();
        tree.delete(b"x".to_vec()).unwrap();
        let entry = tree.get(b"x").unwrap();
        assert!(entry.deleted);
        assert!(entry.value.is_empty());

        // deleting an absent key still writes a tombstone
        tree.delete(b"y".to_vec()).unwrap();
        assert!(tree.get(b"y").unwrap().deleted);

        // a later set resurrects the key
        tree.set(b"x".to_vec(), b"2".to_vec()).unwrap();
        let entry = tree.get(b"x").unwrap();
        assert!(!entry.deleted);
        assert_eq!(entry.value, b"2".to_vec());
        tree.validate().unwrap();
    }

    #[test]
    fn test_set_cas() {
        let tree = small_tree("t-cas", false);
        assert!(matches!(
            tree.set_cas(b"k".to_vec(), b"v".to_vec(), 33),
            Err(Error::InvalidCas)
        ));
        let (_, cas1) = tree.set_cas(b"k".to_vec(), b"v".to_vec(), 0).unwrap();
        let (old, cas2) = tree.set_cas(b"k".to_vec(), b"w".to_vec(), cas1).unwrap();
        assert_eq!(old.unwrap().value, b"v".to_vec());
        assert!(cas2 > cas1);
        assert!(matches!(
            tree.set_cas(b"k".to_vec(), b"z".to_vec(), cas1),
            Err(Error::InvalidCas)
        ));
        assert_eq!(tree.get(b"k").unwrap().value, b"w".to_vec());
    }

    #[test]
    fn test_min_max_range() {
        let tree = small_tree("t-range", false);
        for key in ["a", "b", "c", "d", "e"] {
            tree.set(key.as_bytes().to_vec(), key.as_bytes().to_vec())
                .unwrap();
        }
        assert_eq!(tree.min().unwrap().key, b"a".to_vec());
        assert_eq!(tree.max().unwrap().key, b"e".to_vec());

        let collect = |incl, reverse| {
            let mut keys = Vec::new();
            tree.range_with(Some(b"b"), Some(b"d"), incl, reverse, |entry| {
                keys.push(String::from_utf8(entry.key).unwrap());
                true
            });
            keys
        };
        assert_eq!(collect(Incl::Both, false), vec!["b", "c", "d"]);
        assert_eq!(collect(Incl::High, false), vec!["c", "d"]);
        assert_eq!(collect(Incl::Low, false), vec!["b", "c"]);
        assert_eq!(collect(Incl::None, false), vec!["c"]);
        assert_eq!(collect(Incl::Both, true), vec!["d", "c", "b"]);
        assert_eq!(collect(Incl::None, true), vec!["c"]);
    }

    #[test]
    fn test_random_churn_validates() {
        let tree = small_tree("t-churn", false);
        let mut keys = Vec::new();
        for i in 0..2000u32 {
            let key = format!("key{:05}", i * 7919 % 2000).into_bytes();
            tree.set(key.clone(), format!("value{}", i).into_bytes())
                .unwrap();
            keys.push(key);
        }
        for key in keys.iter().step_by(3) {
            let _ = tree.delete(key.clone());
        }
        tree.validate().unwrap();

        let stats = tree.stats().unwrap();
        assert_eq!(stats.n_count, tree.count());
        assert_eq!(stats.n_count, stats.n_inserts - stats.n_deletes);
        assert_eq!(stats.n_deletes, stats.n_reclaims - stats.n_clones);
    }

    #[test]
    fn test_iterate_refills_across_batches() {
        let tree = small_tree("t-iter", false);
        for i in 0..250u32 {
            tree.set(format!("k{:03}", i).into_bytes(), format!("v{}", i).into_bytes())
                .unwrap();
        }

        let keys: Vec<Vec<u8>> = tree.scan().map(|entry| entry.key).collect();
        assert_eq!(keys.len(), 250);
        assert_eq!(keys[0], b"k000".to_vec());
        assert_eq!(keys[249], b"k249".to_vec());
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));

        let rkeys: Vec<Vec<u8>> = tree
            .iterate(None, None, Incl::Both, true)
            .map(|entry| entry.key)
            .collect();
        assert_eq!(rkeys.len(), 250);
        assert_eq!(rkeys[0], b"k249".to_vec());
        assert_eq!(rkeys[249], b"k000".to_vec());

        let bounded: Vec<Vec<u8>> = tree
            .iterate(
                Some(b"k010".to_vec()),
                Some(b"k200".to_vec()),
                Incl::None,
                false,
            )
            .map(|entry| entry.key)
            .collect();
        assert_eq!(bounded.len(), 189);
        assert_eq!(bounded[0], b"k011".to_vec());
        assert_eq!(bounded[188], b"k199".to_vec());
    }

    #[test]
    fn test_snapshot_isolation() {
        let tree = small_tree("t-iso", false);
        for i in 0..100u32 {
            tree.set(format!("k{:03}", i).into_bytes(), b"old".to_vec())
                .unwrap();
        }
        let mut iter = tree.scan();
        let first = iter.next().unwrap();
        assert_eq!(first.value, b"old".to_vec());

        // overwrite every key while the cursor is live
        for i in 0..100u32 {
            tree.set(format!("k{:03}", i).into_bytes(), b"new".to_vec())
                .unwrap();
        }
        let rest: Vec<_> = iter.collect();
        assert_eq!(rest.len(), 99);
        assert!(rest.iter().all(|entry| entry.value == b"old".to_vec()));

        // a fresh cursor sees the new values
        assert!(tree.scan().all(|entry| entry.value == b"new".to_vec()));
    }

    #[test]
    fn test_purge_frees_after_release() {
        let tree = small_tree("t-purge", false);
        for i in 0..500u32 {
            tree.set(b"hot".to_vec(), format!("v{}", i).into_bytes())
                .unwrap();
        }
        let snap = tree.make_snapshot().unwrap();
        assert_eq!(snap.count(), 1);
        for i in 0..500u32 {
            tree.set(b"hot".to_vec(), format!("w{}", i).into_bytes())
                .unwrap();
        }
        // the pinned snapshot still resolves to its own version
        assert_eq!(snap.get(b"hot").unwrap().value, b"v499".to_vec());
        let stats = tree.stats().unwrap();
        assert!(stats.n_reclaims > stats.n_frees);

        snap.release();
        tree.purge();
        // the ticker keeps purging; wait for the frees to catch up
        for _ in 0..100 {
            let stats = tree.stats().unwrap();
            if stats.n_frees >= stats.n_reclaims {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let stats = tree.stats().unwrap();
        assert!(stats.n_frees >= stats.n_reclaims - 1);
        tree.validate().unwrap();
    }

    #[test]
    fn test_close_idempotent() {
        let tree = small_tree("t-close", false);
        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.close().unwrap();
        tree.close().unwrap();
        assert!(tree.get(b"a").is_none());
        assert!(tree.set(b"b".to_vec(), b"2".to_vec()).is_err());
    }
}
