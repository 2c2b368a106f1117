//! The composite engine: routes reads and writes across the memory and
//! disk tiers, swaps the snapshot pointer, and schedules flush, compact
//! and purge work.

mod compactor;
mod purger;
mod snapshot;

pub(crate) use snapshot::{DiskLevel, Snapshot};

use crate::clock::ScalarClock;
use crate::disk::{parse_level_name, DiskSnapshot, NLEVELS};
use crate::error::Error;
use crate::llrb::{Tree, TreeOptions};
use crate::merge::MergeIter;
use crate::options::{MemStore, Options};
use crate::{Entry, Result};
use crossbeam_channel::{unbounded, Sender};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct Inner {
    pub(crate) name: String,
    pub(crate) opts: Options,
    pub(crate) snapshot: RwLock<Arc<Snapshot>>,
    pub(crate) snapid: ScalarClock,
    pub(crate) mwgen: AtomicU64,
    pub(crate) retired: Mutex<Vec<Arc<Snapshot>>>,
    pub(crate) purge_tx: Sender<()>,
    pub(crate) closed: AtomicBool,
}

impl Inner {
    pub(crate) fn currsnapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Entries must fit a leaf block alongside its slot array, and keys an
    /// interior block, or a later flush could never place them.
    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let zroom = self.opts.zsize.saturating_sub(22);
        let mroom = self.opts.msize.saturating_sub(18);
        if key.len() + value.len() > zroom || key.len() > mroom {
            return Err(Error::EntryTooLarge);
        }
        Ok(())
    }

    /// Hand a replaced snapshot to the purger.
    pub(crate) fn retire(&self, snap: Arc<Snapshot>) {
        snap.mark_trypurge();
        self.retired.lock().unwrap().push(snap);
        let _ = self.purge_tx.send(());
    }
}

/// A referred snapshot; dropping it releases the refcount and, when the
/// snapshot is retired and fully drained, nudges the purger.
pub(crate) struct SnapGuard {
    snap: Arc<Snapshot>,
    inner: Arc<Inner>,
}

impl std::ops::Deref for SnapGuard {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snap
    }
}

impl Drop for SnapGuard {
    fn drop(&mut self) {
        if self.snap.release() == 0 && self.snap.is_trypurge() {
            let _ = self.inner.purge_tx.send(());
        }
    }
}

pub(crate) fn new_tree(name: &str, opts: &Options, gen: u64, seqno: u64) -> Result<Arc<Tree>> {
    let tree = Tree::new(TreeOptions {
        name: format!("{}-mw{}", name, gen),
        lsm: opts.dgm,
        mvcc: opts.memstore == MemStore::Mvcc,
        snapshot_tick: opts.snapshot_tick,
        key_capacity: opts.key_capacity,
        val_capacity: opts.val_capacity,
    })?;
    tree.set_seqno(seqno);
    Ok(Arc::new(tree))
}

/// Persistent ordered key-value store over a multi-tier LSM index.
pub struct TierDb {
    inner: Arc<Inner>,
    compactor: Mutex<Option<JoinHandle<()>>>,
    purger: Mutex<Option<JoinHandle<()>>>,
}

impl TierDb {
    /// Open (or recover) an engine named `name` under the configured disk
    /// paths. The name becomes a file-name prefix and cannot contain `-`.
    pub fn open(name: &str, opts: Options) -> Result<TierDb> {
        opts.validate()?;
        if name.is_empty() || name.contains('-') {
            let msg = format!("engine name {:?} must be non-empty without dashes", name);
            return Err(Error::InvalidConfig(msg));
        }
        for path in &opts.disk_paths {
            std::fs::create_dir_all(path)?;
        }

        let disks = open_disk_snaps(name, &opts)?;
        let seqno = disks
            .iter()
            .flatten()
            .map(|dl| dl.snap.seqno())
            .max()
            .unwrap_or(0);
        let mw = new_tree(name, &opts, 0, seqno)?;

        let snapid = ScalarClock::new(0);
        let head = Snapshot::new(snapid.next(), mw, None, disks);
        let (purge_tx, purge_rx) = unbounded();
        let inner = Arc::new(Inner {
            name: name.to_string(),
            opts,
            snapshot: RwLock::new(head),
            snapid,
            mwgen: AtomicU64::new(1),
            retired: Mutex::new(Vec::new()),
            purge_tx,
            closed: AtomicBool::new(false),
        });

        let pinner = inner.clone();
        let purger = thread::Builder::new()
            .name(format!("{}-purger", name))
            .spawn(move || purger::run(pinner, purge_rx))?;
        let cinner = inner.clone();
        let compactor = thread::Builder::new()
            .name(format!("{}-compactor", name))
            .spawn(move || compactor::run(cinner))?;

        info!("{}: started, recovered seqno {}", name, seqno);
        Ok(TierDb {
            inner,
            compactor: Mutex::new(Some(compactor)),
            purger: Mutex::new(Some(purger)),
        })
    }

    /// Refer the current snapshot under the read lock: retirement only
    /// happens after the swap's write lock is released, so a snapshot
    /// referred here can never be mid-purge.
    fn latest_guard(&self) -> SnapGuard {
        let head = self.inner.snapshot.read().unwrap();
        let snap = head.clone();
        snap.refer();
        drop(head);
        SnapGuard {
            snap,
            inner: self.inner.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `(level, version, footprint)` of every occupied disk level,
    /// newest first.
    pub fn disk_levels(&self) -> Vec<(usize, u64, u64)> {
        let snap = self.inner.currsnapshot();
        snap.disklevels()
            .into_iter()
            .map(|dl| (dl.level, dl.version, dl.snap.footprint()))
            .collect()
    }

    /// Highest seqno assigned by the write-absorbing tree.
    pub fn seqno(&self) -> u64 {
        self.inner.currsnapshot().mw.seqno()
    }

    /// Entries still held by the memory tiers, tombstones included.
    pub fn mem_count(&self) -> i64 {
        let snap = self.inner.currsnapshot();
        snap.mw.count() + snap.mf.as_ref().map_or(0, |mf| mf.count())
    }

    //---- read methods

    /// Tier-ordered lookup. A tombstoned key returns an entry with
    /// `deleted = true`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.inner.ensure_open()?;
        let guard = self.latest_guard();
        guard.yget(key)
    }

    /// Merged scan across every tier; tombstones are yielded for the
    /// caller to filter.
    pub fn scan(&self) -> Result<ScanIter> {
        self.inner.ensure_open()?;
        let guard = self.latest_guard();
        let merge = guard.iterator();
        Ok(ScanIter {
            merge,
            _guard: guard,
        })
    }

    //---- write methods

    /// Returns the replaced entry, if any, and the new cas.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(Option<Entry>, u64)> {
        self.inner.ensure_open()?;
        self.inner.check_entry(key, value)?;
        // hold the reader side of the snapshot lock across the write so
        // a concurrent swap cannot strand it in a frozen tree
        let head = self.inner.snapshot.read().unwrap();
        head.mw.set(key.to_vec(), value.to_vec())
    }

    /// Compare-and-set; `cas == 0` expects the key to be absent.
    pub fn set_cas(&self, key: &[u8], value: &[u8], cas: u64) -> Result<(Option<Entry>, u64)> {
        self.inner.ensure_open()?;
        self.inner.check_entry(key, value)?;
        let head = self.inner.snapshot.read().unwrap();
        head.mw.set_cas(key.to_vec(), value.to_vec(), cas)
    }

    /// Remove a key. With dgm mode on this writes a tombstone; otherwise
    /// deleting an absent key fails with `KeyNotFound`.
    pub fn delete(&self, key: &[u8]) -> Result<(Option<Entry>, u64)> {
        self.inner.ensure_open()?;
        self.inner.check_entry(key, b"")?;
        let head = self.inner.snapshot.read().unwrap();
        head.mw.delete(key.to_vec())
    }

    //---- control methods

    /// Prune stale on-disk file versions left behind by crashes or
    /// superseded flushes.
    pub fn compact(&self) -> Result<()> {
        self.inner.ensure_open()?;
        compactor::compact_disk_versions(&self.inner)
    }

    /// Check the memtree invariants and the disk-level footprint order.
    pub fn validate(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let snap = self.inner.currsnapshot();
        snap.mw.validate()?;
        let levels = snap.disklevels();
        for pair in levels.windows(2) {
            if pair[0].snap.footprint() >= pair[1].snap.footprint() {
                let msg = format!(
                    "level {} footprint {} >= level {} footprint {}",
                    pair[0].level,
                    pair[0].snap.footprint(),
                    pair[1].level,
                    pair[1].snap.footprint()
                );
                return Err(Error::corruption(msg));
            }
        }
        Ok(())
    }

    /// Stop background tasks, drain retired snapshots and close every
    /// tier. Entries not yet flushed are lost, as there is no write-ahead
    /// log. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("{}: closing", self.inner.name);
        if let Some(handle) = self.compactor.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = self.inner.purge_tx.send(());
        if let Some(handle) = self.purger.lock().unwrap().take() {
            let _ = handle.join();
        }
        // wait for retired snapshots and in-flight readers to drain
        loop {
            purger::purge_retired(&self.inner);
            let drained = self.inner.retired.lock().unwrap().is_empty();
            let snap = self.inner.currsnapshot();
            if drained && snap.refcount() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        let snap = self.inner.currsnapshot();
        snap.mw.close()?;
        if let Some(mf) = &snap.mf {
            mf.close()?;
        }
        for dl in snap.disks.iter().flatten() {
            dl.snap.close();
        }
        info!("{}: closed", self.inner.name);
        Ok(())
    }

    /// Close, then delete every disk file belonging to this engine.
    pub fn destroy(&self) -> Result<()> {
        self.close()?;
        for path in &self.inner.opts.disk_paths {
            let dir = match std::fs::read_dir(path) {
                Ok(dir) => dir,
                Err(err) => {
                    warn!("{}: destroy {}: {}", self.inner.name, path.display(), err);
                    continue;
                }
            };
            for dirent in dir.flatten() {
                if let Ok(fname) = dirent.file_name().into_string() {
                    if parse_level_name(&self.inner.name, &fname).is_some() {
                        DiskSnapshot::purge(&fname, &self.inner.opts.disk_paths);
                    }
                }
            }
        }
        info!("{}: destroyed", self.inner.name);
        Ok(())
    }
}

impl Drop for TierDb {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Merged iterator over one referred composite snapshot.
pub struct ScanIter {
    merge: MergeIter,
    _guard: SnapGuard,
}

impl Iterator for ScanIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        self.merge.next()
    }
}

/// Recover disk levels: open the highest version per level, treat
/// unreadable files as absent, and delete superseded versions once a
/// newer one has opened.
fn open_disk_snaps(name: &str, opts: &Options) -> Result<[Option<DiskLevel>; NLEVELS]> {
    let mut found: BTreeMap<usize, BTreeMap<u64, String>> = BTreeMap::new();
    for path in &opts.disk_paths {
        for dirent in std::fs::read_dir(path)? {
            let dirent = dirent?;
            let fname = match dirent.file_name().into_string() {
                Ok(fname) => fname,
                Err(_) => continue,
            };
            if let Some((level, version, _)) = parse_level_name(name, &fname) {
                found.entry(level).or_default().insert(version, fname);
            }
        }
    }

    let mut disks: [Option<DiskLevel>; NLEVELS] = Default::default();
    for (level, versions) in found {
        let mut opened: Option<DiskLevel> = None;
        let mut stale: Vec<&String> = Vec::new();
        for (&version, fname) in versions.iter().rev() {
            if opened.is_some() {
                stale.push(fname);
                continue;
            }
            match DiskSnapshot::open(fname, &opts.disk_paths, opts.mmap) {
                Ok(snap) => {
                    opened = Some(DiskLevel {
                        level,
                        version,
                        snap: Arc::new(snap),
                    });
                }
                Err(err) => {
                    warn!("{}: treating {} as absent: {}", name, fname, err);
                }
            }
        }
        for fname in stale {
            DiskSnapshot::purge(fname, &opts.disk_paths);
        }
        disks[level] = opened;
    }
    Ok(disks)
}
