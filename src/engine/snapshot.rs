use crate::disk::{DiskSnapshot, NLEVELS};
use crate::llrb::Tree;
use crate::merge::{EntrySource, MergeIter};
use crate::{Entry, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// One opened disk level with the level/version parsed from its file
/// name.
#[derive(Clone)]
pub(crate) struct DiskLevel {
    pub level: usize,
    pub version: u64,
    pub snap: Arc<DiskSnapshot>,
}

/// Immutable composite view installed behind the engine's snapshot
/// pointer: the write-absorbing memtree, at most one flushing memtree and
/// the disk-level array. `refcount` tracks in-flight readers; once
/// `trypurge` is set and the count drains the purger reclaims whatever
/// this snapshot no longer shares with the current one.
pub(crate) struct Snapshot {
    pub id: u64,
    pub mw: Arc<Tree>,
    pub mf: Option<Arc<Tree>>,
    pub disks: [Option<DiskLevel>; NLEVELS],
    refcount: AtomicI64,
    trypurge: AtomicBool,
}

impl Snapshot {
    pub fn new(
        id: u64,
        mw: Arc<Tree>,
        mf: Option<Arc<Tree>>,
        disks: [Option<DiskLevel>; NLEVELS],
    ) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            id,
            mw,
            mf,
            disks,
            refcount: AtomicI64::new(0),
            trypurge: AtomicBool::new(false),
        })
    }

    pub fn refer(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the remaining count.
    pub fn release(&self) -> i64 {
        let count = self.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(count >= 0, "snapshot refcount went negative");
        count
    }

    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn mark_trypurge(&self) {
        self.trypurge.store(true, Ordering::SeqCst);
    }

    pub fn is_trypurge(&self) -> bool {
        self.trypurge.load(Ordering::SeqCst)
    }

    /// Tier-ordered lookup: memtree, then the flushing tree, then every
    /// disk level newest first. The first occurrence wins and a tombstone
    /// counts as an occurrence.
    pub fn yget(&self, key: &[u8]) -> Result<Option<Entry>> {
        if let Some(entry) = self.mw.get(key) {
            return Ok(Some(entry));
        }
        if let Some(mf) = &self.mf {
            if let Some(entry) = mf.get(key) {
                return Ok(Some(entry));
            }
        }
        for dl in self.disks.iter().flatten() {
            if let Some(entry) = dl.snap.get(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// K-way merge over every tier, newest first; tombstones included.
    pub fn iterator(&self) -> MergeIter {
        let mut sources: Vec<EntrySource> = Vec::with_capacity(2 + NLEVELS);
        sources.push(Box::new(self.mw.scan()));
        if let Some(mf) = &self.mf {
            sources.push(Box::new(mf.scan()));
        }
        for dl in self.disks.iter().flatten() {
            sources.push(Box::new(dl.snap.scan()));
        }
        MergeIter::new(sources)
    }

    /// The newest disk: the smallest occupied level index.
    pub fn latestlevel(&self) -> Option<&DiskLevel> {
        self.disks.iter().flatten().next()
    }

    /// Lowest empty slot strictly greater than `from`.
    pub fn nextemptylevel(&self, from: usize) -> Option<usize> {
        ((from + 1)..NLEVELS).find(|&level| self.disks[level].is_none())
    }

    /// Occupied levels, newest first.
    pub fn disklevels(&self) -> Vec<&DiskLevel> {
        self.disks.iter().flatten().collect()
    }

    /// Estimated memory held by the write-absorbing tree.
    pub fn memheap(&self) -> usize {
        self.mw.footprint()
    }
}
