use crate::engine::{Inner, Snapshot};
use crate::llrb::Tree;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Background task reclaiming retired snapshots: wakes on signal or every
/// 100ms, closes retired memtrees and deletes disk files no newer
/// snapshot references, and drives the memtree reclaim cycle.
pub(crate) fn run(inner: Arc<Inner>, rx: Receiver<()>) {
    info!("{}: purger start", inner.name);
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Err(RecvTimeoutError::Disconnected) => break,
            _ => {}
        }
        if inner.is_closed() {
            break;
        }
        purge_retired(&inner);
        let snap = inner.currsnapshot();
        snap.mw.purge();
        if let Some(mf) = &snap.mf {
            mf.purge();
        }
    }
    info!("{}: purger exit", inner.name);
}

/// Reclaim retired snapshots whose refcount has drained. Resources still
/// shared with the current snapshot, or with retired snapshots that still
/// have readers, are left alone.
pub(crate) fn purge_retired(inner: &Inner) {
    let current = inner.currsnapshot();

    let mut guard = inner.retired.lock().unwrap();
    let mut removable = Vec::new();
    let mut remaining = Vec::new();
    for snap in guard.drain(..) {
        if snap.is_trypurge() && snap.refcount() == 0 {
            removable.push(snap);
        } else {
            remaining.push(snap);
        }
    }
    let mut keep_disks: HashSet<String> = HashSet::new();
    let mut keep_trees: Vec<Arc<Tree>> = Vec::new();
    note_live(&current, &mut keep_disks, &mut keep_trees);
    for snap in remaining.iter() {
        note_live(snap, &mut keep_disks, &mut keep_trees);
    }
    *guard = remaining;
    drop(guard);

    for snap in removable {
        for dl in snap.disks.iter().flatten() {
            if !keep_disks.contains(dl.snap.name()) {
                if let Err(err) = dl.snap.destroy() {
                    error!("{}: destroying {}: {}", inner.name, dl.snap.name(), err);
                }
            }
        }
        let mut trees = vec![&snap.mw];
        if let Some(mf) = &snap.mf {
            trees.push(mf);
        }
        for tree in trees {
            if !keep_trees.iter().any(|keep| Arc::ptr_eq(keep, tree)) {
                debug!("{}: retiring memtree {}", inner.name, tree.name());
                let _ = tree.destroy();
            }
        }
        debug!("{}: snapshot #{} purged", inner.name, snap.id);
    }
}

fn note_live(snap: &Snapshot, keep_disks: &mut HashSet<String>, keep_trees: &mut Vec<Arc<Tree>>) {
    for dl in snap.disks.iter().flatten() {
        keep_disks.insert(dl.snap.name().to_string());
    }
    keep_trees.push(snap.mw.clone());
    if let Some(mf) = &snap.mf {
        keep_trees.push(mf.clone());
    }
}
