use crate::disk::block::{Block, M_CHILD_FLAG};
use crate::disk::footer::{Footer, Metadata, FOOTER_SIZE};
use crate::error::Error;
use crate::Incl;
use crate::{Entry, Result};
use log::{error, info};
use memmap::Mmap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

enum Source {
    Mmap(Mmap),
    Positional(Mutex<File>),
}

/// Read handle over one immutable level file, memory-mapped or served by
/// positional reads. The root block is decoded once and cached.
pub struct DiskSnapshot {
    name: String,
    filepath: PathBuf,
    source: Source,
    footer: Footer,
    metadata: Metadata,
    file_len: u64,
    root_block: Block,
    closed: AtomicBool,
}

impl DiskSnapshot {
    /// Locate `name` under one of `paths` and open it.
    pub fn open(name: &str, paths: &[PathBuf], mmap: bool) -> Result<DiskSnapshot> {
        for path in paths {
            let filepath = path.join(name);
            if filepath.is_file() {
                return Self::open_file(name, filepath, mmap);
            }
        }
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no file {} under the configured paths", name),
        )))
    }

    fn open_file(name: &str, filepath: PathBuf, mmap: bool) -> Result<DiskSnapshot> {
        let mut file = File::open(&filepath)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE {
            return Err(Error::corruption("file shorter than its footer"));
        }
        let footer = Footer::load(&mut file)?;
        if footer.mdlen > file_len - FOOTER_SIZE {
            return Err(Error::corruption("footer fields out of range"));
        }
        let blocks_end = file_len - FOOTER_SIZE - footer.mdlen;
        let root_end = footer.root_offset.checked_add(footer.msize);
        if footer.msize < 512 || footer.zsize < 512 || root_end.map_or(true, |end| end > blocks_end)
        {
            return Err(Error::corruption("footer fields out of range"));
        }

        file.seek(SeekFrom::Start(blocks_end))?;
        let mut md = vec![0u8; footer.mdlen as usize];
        file.read_exact(&mut md)?;
        let metadata = Metadata::decode(&md)?;

        let source = if mmap {
            Source::Mmap(unsafe { Mmap::map(&file)? })
        } else {
            Source::Positional(Mutex::new(file))
        };

        let mut snapshot = DiskSnapshot {
            name: name.to_string(),
            filepath,
            source,
            footer,
            metadata,
            file_len,
            root_block: Block::from_bytes(vec![0u8; 4])?,
            closed: AtomicBool::new(false),
        };
        let root = snapshot.read_bytes(
            snapshot.footer.root_offset,
            snapshot.footer.msize as usize,
        )?;
        snapshot.root_block = Block::from_bytes(root)?;
        info!(
            "{}: open snapshot, {} entries, {} bytes",
            snapshot.name, snapshot.footer.count, file_len
        );
        Ok(snapshot)
    }

    fn read_bytes(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if off.checked_add(len as u64).map_or(true, |end| end > self.file_len) {
            return Err(Error::corruption("block reference past end of file"));
        }
        match &self.source {
            Source::Mmap(map) => Ok(map[off as usize..off as usize + len].to_vec()),
            Source::Positional(file) => {
                let mut guard = file.lock().unwrap();
                guard.seek(SeekFrom::Start(off))?;
                let mut buf = vec![0u8; len];
                guard.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Follow a child back-reference; bit 0 says whether the child is an
    /// interior block.
    fn read_child(&self, child: u64) -> Result<(Block, bool)> {
        let is_m = child & M_CHILD_FLAG != 0;
        let off = child & !M_CHILD_FLAG;
        let len = if is_m {
            self.footer.msize as usize
        } else {
            self.footer.zsize as usize
        };
        Ok((Block::from_bytes(self.read_bytes(off, len)?)?, is_m))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let mut idx = match self.root_block.search_le(key) {
            None => return Ok(None),
            Some(idx) => idx,
        };
        let mut child = self.root_block.child_at(idx);
        loop {
            let (blk, is_m) = self.read_child(child)?;
            if !is_m {
                return Ok(blk.find_exact(key));
            }
            idx = match blk.search_le(key) {
                None => return Ok(None),
                Some(idx) => idx,
            };
            child = blk.child_at(idx);
        }
    }

    /// Stream entries between the bounds; tombstones are included.
    pub fn iter(
        self: &Arc<Self>,
        lo: Option<Vec<u8>>,
        hi: Option<Vec<u8>>,
        incl: Incl,
        reverse: bool,
    ) -> DiskIter {
        DiskIter::new(self.clone(), lo, hi, incl, reverse)
    }

    pub fn scan(self: &Arc<Self>) -> DiskIter {
        self.iter(None, None, Incl::Both, false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File size in bytes.
    pub fn footprint(&self) -> u64 {
        self.file_len
    }

    pub fn count(&self) -> u64 {
        self.footer.count
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn seqno(&self) -> u64 {
        self.metadata.seqno
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop serving reads; the file stays on disk. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Close and delete the file.
    pub fn destroy(&self) -> Result<()> {
        self.close();
        match std::fs::remove_file(&self.filepath) {
            Ok(()) => {
                info!("{}: destroyed {}", self.name, self.filepath.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a level file without opening it.
    pub fn purge(name: &str, paths: &[PathBuf]) {
        for path in paths {
            let filepath = path.join(name);
            if filepath.is_file() {
                if let Err(err) = std::fs::remove_file(&filepath) {
                    error!("{}: purge {}: {}", name, filepath.display(), err);
                }
            }
        }
    }
}

/// Cursor over one level file: a stack of interior slots above the
/// current leaf. The leaf position counts forward (next slot to emit) or,
/// in reverse, the number of slots still to emit. Read failures end the
/// stream after logging.
pub struct DiskIter {
    snap: Arc<DiskSnapshot>,
    stack: Vec<(Block, usize)>,
    leaf: Option<(Block, usize)>,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    incl: Incl,
    reverse: bool,
    done: bool,
}

impl DiskIter {
    fn new(
        snap: Arc<DiskSnapshot>,
        lo: Option<Vec<u8>>,
        hi: Option<Vec<u8>>,
        incl: Incl,
        reverse: bool,
    ) -> DiskIter {
        let mut iter = DiskIter {
            snap,
            stack: Vec::new(),
            leaf: None,
            lo,
            hi,
            incl,
            reverse,
            done: false,
        };
        if let Err(err) = iter.seek() {
            error!("{}: iterator seek: {}", iter.snap.name(), err);
            iter.done = true;
        }
        iter
    }

    #[inline]
    fn lo_inclusive(&self) -> bool {
        matches!(self.incl, Incl::Both | Incl::Low)
    }

    #[inline]
    fn hi_inclusive(&self) -> bool {
        matches!(self.incl, Incl::Both | Incl::High)
    }

    /// Descend to the leaf holding the start bound and position in it.
    fn seek(&mut self) -> Result<()> {
        let seek_key = if self.reverse {
            self.hi.clone()
        } else {
            self.lo.clone()
        };
        let mut blk = self.snap.root_block.clone();
        if blk.count() == 0 {
            self.done = true;
            return Ok(());
        }
        loop {
            let idx = match &seek_key {
                Some(key) => blk.search_le(key).unwrap_or(0),
                None if self.reverse => blk.count() - 1,
                None => 0,
            };
            let child = blk.child_at(idx);
            self.stack.push((blk, idx));
            let (next, is_m) = self.snap.read_child(child)?;
            if is_m {
                blk = next;
                continue;
            }
            let pos = match &seek_key {
                Some(key) if self.reverse => match next.search_le(key) {
                    // every slot sorts after the bound; advance left
                    None => 0,
                    Some(at) => {
                        if !self.hi_inclusive() && next.key_at(at) == key.as_slice() {
                            at
                        } else {
                            at + 1
                        }
                    }
                },
                Some(key) => {
                    let mut at = next.search_ge(key);
                    if !self.lo_inclusive() && at < next.count() && next.key_at(at) == key.as_slice()
                    {
                        at += 1;
                    }
                    at
                }
                None if self.reverse => next.count(),
                None => 0,
            };
            self.leaf = Some((next, pos));
            return Ok(());
        }
    }

    /// Is `key` past the stop bound in the direction of travel?
    fn beyond(&self, key: &[u8]) -> bool {
        if self.reverse {
            match &self.lo {
                Some(lo) => {
                    if self.lo_inclusive() {
                        key < lo.as_slice()
                    } else {
                        key <= lo.as_slice()
                    }
                }
                None => false,
            }
        } else {
            match &self.hi {
                Some(hi) => {
                    if self.hi_inclusive() {
                        key > hi.as_slice()
                    } else {
                        key >= hi.as_slice()
                    }
                }
                None => false,
            }
        }
    }

    /// Move to the adjacent leaf in the direction of travel.
    fn advance(&mut self) -> Result<()> {
        self.leaf = None;
        loop {
            match self.stack.last_mut() {
                None => {
                    self.done = true;
                    return Ok(());
                }
                Some((mblk, idx)) => {
                    if self.reverse {
                        if *idx == 0 {
                            self.stack.pop();
                            continue;
                        }
                        *idx -= 1;
                    } else {
                        *idx += 1;
                        if *idx >= mblk.count() {
                            self.stack.pop();
                            continue;
                        }
                    }
                    break;
                }
            }
        }
        let (mblk, idx) = self.stack.last().unwrap();
        let mut child = mblk.child_at(*idx);
        loop {
            let (blk, is_m) = self.snap.read_child(child)?;
            if is_m {
                let at = if self.reverse { blk.count() - 1 } else { 0 };
                child = blk.child_at(at);
                self.stack.push((blk, at));
            } else {
                let pos = if self.reverse { blk.count() } else { 0 };
                self.leaf = Some((blk, pos));
                return Ok(());
            }
        }
    }
}

impl Iterator for DiskIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            if self.done {
                return None;
            }
            let entry = match &mut self.leaf {
                Some((blk, pos)) => {
                    if self.reverse {
                        if *pos > 0 {
                            *pos -= 1;
                            Some(blk.entry_at(*pos))
                        } else {
                            None
                        }
                    } else if *pos < blk.count() {
                        let entry = blk.entry_at(*pos);
                        *pos += 1;
                        Some(entry)
                    } else {
                        None
                    }
                }
                None => None,
            };
            match entry {
                Some(entry) => {
                    if self.beyond(&entry.key) {
                        self.done = true;
                        return None;
                    }
                    return Some(entry);
                }
                None => {
                    if let Err(err) = self.advance() {
                        error!("{}: iterator advance: {}", self.snap.name(), err);
                        self.done = true;
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::build::Builder;
    use crate::disk::{level_name, random_uuid};
    use tempfile::TempDir;

    fn build_file(dir: &std::path::Path, n: usize, zsize: usize) -> String {
        let name = level_name("tst", 15, 1, &random_uuid());
        let mut builder = Builder::new(&name, dir, 1024, zsize).unwrap();
        let entries = (0..n).map(|i| {
            let mut entry = Entry::new(
                format!("key{:06}", i).into_bytes(),
                format!("value{:06}", i).into_bytes(),
                i as u64 + 1,
            );
            if i % 7 == 0 {
                entry.deleted = true;
                entry.value.clear();
            }
            entry
        });
        builder.build(entries).unwrap();
        builder.finish(&Metadata::new(n as u64, 1700000000)).unwrap();
        name
    }

    fn open(dir: &std::path::Path, name: &str, mmap: bool) -> Arc<DiskSnapshot> {
        Arc::new(DiskSnapshot::open(name, &[dir.to_path_buf()], mmap).unwrap())
    }

    #[test]
    fn test_build_open_get() {
        let tmp = TempDir::new().unwrap();
        let name = build_file(tmp.path(), 5000, 1024);
        for mmap in [false, true] {
            let snap = open(tmp.path(), &name, mmap);
            assert_eq!(snap.count(), 5000);
            assert_eq!(snap.seqno(), 5000);
            assert!(snap.footprint() > 0);

            let entry = snap.get(b"key000123").unwrap().unwrap();
            assert_eq!(entry.value, b"value000123".to_vec());
            assert_eq!(entry.seqno, 124);
            assert!(!entry.deleted);

            // multiples of 7 were written as tombstones
            let entry = snap.get(b"key000007").unwrap().unwrap();
            assert!(entry.deleted);
            assert!(entry.value.is_empty());

            assert!(snap.get(b"key005000").unwrap().is_none());
            assert!(snap.get(b"aaa").unwrap().is_none());
            assert!(snap.get(b"zzz").unwrap().is_none());
        }
    }

    #[test]
    fn test_full_scan_round_trip() {
        let tmp = TempDir::new().unwrap();
        let name = build_file(tmp.path(), 5000, 1024);
        let snap = open(tmp.path(), &name, false);
        let keys: Vec<Vec<u8>> = snap.scan().map(|entry| entry.key).collect();
        assert_eq!(keys.len(), 5000);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(key, &format!("key{:06}", i).into_bytes());
        }
    }

    #[test]
    fn test_range_iterate() {
        let tmp = TempDir::new().unwrap();
        let name = build_file(tmp.path(), 1000, 1024);
        let snap = open(tmp.path(), &name, false);

        let lo = b"key000100".to_vec();
        let hi = b"key000200".to_vec();
        let keys: Vec<Vec<u8>> = snap
            .iter(Some(lo.clone()), Some(hi.clone()), Incl::Both, false)
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys.len(), 101);
        assert_eq!(keys[0], lo);
        assert_eq!(keys[100], hi);

        let keys: Vec<Vec<u8>> = snap
            .iter(Some(lo.clone()), Some(hi.clone()), Incl::None, false)
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys.len(), 99);
        assert_eq!(keys[0], b"key000101".to_vec());

        let keys: Vec<Vec<u8>> = snap
            .iter(Some(lo.clone()), Some(hi.clone()), Incl::Both, true)
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys.len(), 101);
        assert_eq!(keys[0], hi);
        assert_eq!(keys[100], lo);

        // bounds that fall between keys
        let keys: Vec<Vec<u8>> = snap
            .iter(Some(b"key0000995".to_vec()), None, Incl::Both, false)
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys.len(), 900);
        assert_eq!(keys[0], b"key000100".to_vec());
    }

    #[test]
    fn test_destroy_removes_file() {
        let tmp = TempDir::new().unwrap();
        let name = build_file(tmp.path(), 100, 1024);
        let snap = open(tmp.path(), &name, false);
        snap.close();
        assert!(snap.get(b"key000001").is_err());
        snap.destroy().unwrap();
        assert!(DiskSnapshot::open(&name, &[tmp.path().to_path_buf()], false).is_err());
        // destroy is idempotent
        snap.destroy().unwrap();
    }
}
