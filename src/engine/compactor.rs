use crate::disk::{build_path, level_name, random_uuid, Builder, DiskSnapshot, Metadata, NLEVELS};
use crate::engine::snapshot::DiskLevel;
use crate::engine::{new_tree, Inner, Snapshot};
use crate::merge::{EntrySource, MergeIter};
use crate::Result;
use log::{error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Background task evaluating the flush and compact triggers every
/// `compact_tick`; executes at most one build per tick.
pub(crate) fn run(inner: Arc<Inner>) {
    info!("{}: compactor start", inner.name);
    loop {
        thread::sleep(inner.opts.compact_tick);
        if inner.is_closed() {
            break;
        }
        let result = if flush_needed(&inner) {
            do_flush(&inner)
        } else {
            do_compact(&inner)
        };
        if let Err(err) = result {
            // the engine stays on its previous snapshot; retried next tick
            error!("{}: background build: {}", inner.name, err);
        }
    }
    info!("{}: compactor exit", inner.name);
}

pub(crate) fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

fn flush_needed(inner: &Inner) -> bool {
    let snap = inner.currsnapshot();
    if snap.mf.is_some() {
        // an earlier flush attempt left its frozen tree behind
        return true;
    }
    if snap.mw.count() == 0 {
        return false;
    }
    if snap.memheap() >= inner.opts.memcapacity() {
        return true;
    }
    flush_elapsed(inner, &snap)
}

/// True when the newest disk file is older than the configured period.
fn flush_elapsed(inner: &Inner, snap: &Snapshot) -> bool {
    if let Some(dl) = snap.latestlevel() {
        if let Ok(secs) = dl.snap.metadata().flushunix_secs() {
            return unix_now() - secs > inner.opts.period.as_secs() as i64;
        }
    }
    false
}

/// Which disk joins the flush, and the target level and version.
fn pick_flush_disk(inner: &Inner, snap: &Snapshot, memheap: usize) -> (Option<DiskLevel>, usize, u64) {
    match snap.latestlevel() {
        None => (None, NLEVELS - 1, 1),
        Some(dl) => {
            let footprint = dl.snap.footprint() as f64;
            if memheap as f64 / footprint > inner.opts.ratio && dl.level > 0 {
                // memory outgrew the newest disk; open the next level up
                (Some(dl.clone()), dl.level - 1, 1)
            } else {
                (Some(dl.clone()), dl.level, dl.version + 1)
            }
        }
    }
}

fn do_flush(inner: &Inner) -> Result<()> {
    // freeze the write-absorbing tree, unless a failed attempt already did
    let snap = inner.currsnapshot();
    let frozen = match &snap.mf {
        Some(mf) => mf.clone(),
        None => {
            let mut head = inner.snapshot.write().unwrap();
            let old = head.clone();
            let gen = inner.mwgen.fetch_add(1, Ordering::SeqCst);
            let mw = new_tree(&inner.name, &inner.opts, gen, old.mw.seqno())?;
            let frozen = old.mw.clone();
            let next = Snapshot::new(
                inner.snapid.next(),
                mw,
                Some(frozen.clone()),
                old.disks.clone(),
            );
            *head = next;
            drop(head);
            inner.retire(old);
            frozen
        }
    };

    let snap = inner.currsnapshot();
    let (input, level, version) = pick_flush_disk(inner, &snap, frozen.footprint());

    if frozen.count() == 0 && input.is_none() {
        // nothing to persist; drop the empty frozen tree
        install(inner, |disks| disks)?;
        return Ok(());
    }

    info!(
        "{}: flushing {} entries to level {} version {}",
        inner.name,
        frozen.count(),
        level,
        version
    );

    let mut seqno = frozen.seqno();
    let mut sources: Vec<EntrySource> = vec![Box::new(frozen.scan())];
    if let Some(dl) = &input {
        seqno = seqno.max(dl.snap.seqno());
        sources.push(Box::new(dl.snap.scan()));
    }
    let ndisk = build_disk(inner, sources, seqno, level, version)?;

    let retired_level = input.map(|dl| dl.level);
    install(inner, move |mut disks| {
        if let Some(rl) = retired_level {
            disks[rl] = None;
        }
        disks[level] = Some(ndisk);
        disks
    })
}

/// Adjacent pair whose size ratio crossed the threshold, and the target
/// slot for their merge.
fn pick_compact_disks(inner: &Inner, snap: &Snapshot) -> Option<(DiskLevel, DiskLevel, usize, u64)> {
    let levels = snap.disklevels();
    for pair in levels.windows(2) {
        let (d0, d1) = (pair[0], pair[1]);
        let footprint0 = d0.snap.footprint() as f64;
        let footprint1 = d1.snap.footprint() as f64;
        if footprint0 / footprint1 < inner.opts.ratio {
            continue;
        }
        let target = snap
            .nextemptylevel(d1.level)
            .or_else(|| snap.nextemptylevel(d0.level))
            .unwrap_or(d1.level);
        let version = if target == d1.level { d1.version + 1 } else { 1 };
        return Some((d0.clone(), d1.clone(), target, version));
    }
    None
}

fn do_compact(inner: &Inner) -> Result<()> {
    let snap = inner.currsnapshot();
    let (d0, d1, target, version) = match pick_compact_disks(inner, &snap) {
        None => return Ok(()),
        Some(plan) => plan,
    };
    info!(
        "{}: compacting levels {} and {} into level {} version {}",
        inner.name, d0.level, d1.level, target, version
    );

    let seqno = d0.snap.seqno().max(d1.snap.seqno());
    // tombstones are carried through; a still older level may resolve them
    let sources: Vec<EntrySource> = vec![Box::new(d0.snap.scan()), Box::new(d1.snap.scan())];
    let ndisk = build_disk(inner, sources, seqno, target, version)?;

    let (l0, l1) = (d0.level, d1.level);
    install(inner, move |mut disks| {
        disks[l0] = None;
        disks[l1] = None;
        disks[target] = Some(ndisk);
        disks
    })
}

/// Build a level file from merged sources; on failure the partial file is
/// removed and the previous snapshot stays in place.
fn build_disk(
    inner: &Inner,
    sources: Vec<EntrySource>,
    seqno: u64,
    level: usize,
    version: u64,
) -> Result<DiskLevel> {
    let name = level_name(&inner.name, level, version, &random_uuid());
    let dir = build_path(&inner.opts.disk_paths, level);
    let mut builder = Builder::new(&name, dir, inner.opts.msize, inner.opts.zsize)?;
    let result: Result<()> = (|| {
        builder.build(MergeIter::new(sources))?;
        let metadata = Metadata::new(seqno.max(builder.maxseqno()), unix_now());
        builder.finish(&metadata)?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = builder.discard();
        return Err(err);
    }
    let snap = DiskSnapshot::open(&name, &inner.opts.disk_paths, inner.opts.mmap)?;
    Ok(DiskLevel {
        level,
        version,
        snap: Arc::new(snap),
    })
}

/// Swap in a new composite snapshot derived from the current one and
/// retire its predecessor. The write lock excludes in-flight writers for
/// the duration of the pointer replacement.
fn install<F>(inner: &Inner, update: F) -> Result<()>
where
    F: FnOnce([Option<DiskLevel>; NLEVELS]) -> [Option<DiskLevel>; NLEVELS],
{
    let mut head = inner.snapshot.write().unwrap();
    let old = head.clone();
    let disks = update(old.disks.clone());
    let next = Snapshot::new(inner.snapid.next(), old.mw.clone(), None, disks);
    *head = next;
    drop(head);
    inner.retire(old);
    Ok(())
}

/// Prune stale on-disk versions: files of this engine that no live or
/// retired snapshot references and that are strictly older than the live
/// version at their level.
pub(crate) fn compact_disk_versions(inner: &Inner) -> Result<()> {
    let snap = inner.currsnapshot();
    let mut live: std::collections::HashSet<String> = snap
        .disks
        .iter()
        .flatten()
        .map(|dl| dl.snap.name().to_string())
        .collect();
    for retired in inner.retired.lock().unwrap().iter() {
        for dl in retired.disks.iter().flatten() {
            live.insert(dl.snap.name().to_string());
        }
    }

    for path in &inner.opts.disk_paths {
        for dirent in std::fs::read_dir(path)? {
            let dirent = dirent?;
            let fname = match dirent.file_name().into_string() {
                Ok(fname) => fname,
                Err(_) => continue,
            };
            let (level, version, _) = match crate::disk::parse_level_name(&inner.name, &fname) {
                None => continue,
                Some(parsed) => parsed,
            };
            if live.contains(&fname) {
                continue;
            }
            let live_version = snap.disks[level].as_ref().map(|dl| dl.version);
            if let Some(live_version) = live_version {
                if version < live_version {
                    info!("{}: pruning stale version {}", inner.name, fname);
                    DiskSnapshot::purge(&fname, &inner.opts.disk_paths);
                }
            }
        }
    }
    Ok(())
}
