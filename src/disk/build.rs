use crate::disk::block::{m_entry_size, z_entry_size, BlockBuild, M_CHILD_FLAG};
use crate::disk::footer::{Footer, Metadata};
use crate::error::Error;
use crate::ioutils::BufWriterWithPos;
use crate::{Entry, Result};
use log::info;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Builds one immutable level file from a sorted, key-unique iterator of
/// entries. Leaves fill bottom-up; each flushed block feeds its first key
/// and offset into the interior level above it.
pub struct Builder {
    name: String,
    filepath: PathBuf,
    file: BufWriterWithPos<std::fs::File>,
    msize: usize,
    zsize: usize,
    leaf: BlockBuild,
    interior: Vec<BlockBuild>,
    count: u64,
    maxseqno: u64,
}

impl Builder {
    pub fn new(name: &str, dir: &Path, msize: usize, zsize: usize) -> Result<Builder> {
        std::fs::create_dir_all(dir)?;
        let filepath = dir.join(name);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&filepath)?;
        Ok(Builder {
            name: name.to_string(),
            filepath,
            file: BufWriterWithPos::new(file)?,
            msize,
            zsize,
            leaf: BlockBuild::new(zsize),
            interior: Vec::new(),
            count: 0,
            maxseqno: 0,
        })
    }

    /// Drain the iterator into leaf blocks. May be called once; `finish`
    /// seals the file.
    pub fn build(&mut self, iter: impl Iterator<Item = Entry>) -> Result<()> {
        for entry in iter {
            self.add(&entry)?;
        }
        Ok(())
    }

    fn add(&mut self, entry: &Entry) -> Result<()> {
        if 4 + 4 + z_entry_size(entry.key.len(), entry.value.len()) > self.zsize
            || 4 + 4 + m_entry_size(entry.key.len()) > self.msize
        {
            return Err(Error::EntryTooLarge);
        }
        if !self.leaf.add_leaf(entry) {
            self.flush_leaf()?;
            if !self.leaf.add_leaf(entry) {
                return Err(Error::EntryTooLarge);
            }
        }
        self.count += 1;
        if entry.seqno > self.maxseqno {
            self.maxseqno = entry.seqno;
        }
        Ok(())
    }

    fn flush_leaf(&mut self) -> Result<()> {
        debug_assert!(!self.leaf.is_empty());
        let offset = self.file.pos;
        let bytes = self.leaf.finalize();
        let first = self.leaf.first_key().to_vec();
        self.leaf.reset();
        self.file.write_all(&bytes)?;
        self.add_child_ref(0, first, offset)
    }

    /// Feed `(first key, back-reference)` of a flushed block into the
    /// interior level above it, flushing that level when full.
    fn add_child_ref(&mut self, level: usize, key: Vec<u8>, child: u64) -> Result<()> {
        if self.interior.len() == level {
            self.interior.push(BlockBuild::new(self.msize));
        }
        if self.interior[level].add_child(&key, child) {
            return Ok(());
        }
        let offset = self.file.pos;
        let (bytes, first) = {
            let blk = &mut self.interior[level];
            let bytes = blk.finalize();
            let first = blk.first_key().to_vec();
            blk.reset();
            (bytes, first)
        };
        self.file.write_all(&bytes)?;
        self.add_child_ref(level + 1, first, offset | M_CHILD_FLAG)?;
        if !self.interior[level].add_child(&key, child) {
            return Err(Error::EntryTooLarge);
        }
        Ok(())
    }

    /// Roll up partial blocks, then write the metadata trailer and the
    /// footer. Returns the total entry count.
    pub fn finish(&mut self, metadata: &Metadata) -> Result<u64> {
        if self.count == 0 {
            return Err(Error::corruption("building a level file with no entries"));
        }
        if !self.leaf.is_empty() {
            self.flush_leaf()?;
        }

        let mut carry: Option<(Vec<u8>, u64)> = None;
        let mut root_offset = 0u64;
        let mut level = 0;
        while level < self.interior.len() {
            if let Some((key, child)) = carry.take() {
                self.add_child_ref(level, key, child)?;
            }
            if !self.interior[level].is_empty() {
                let offset = self.file.pos;
                let (bytes, first) = {
                    let blk = &mut self.interior[level];
                    let bytes = blk.finalize();
                    let first = blk.first_key().to_vec();
                    blk.reset();
                    (bytes, first)
                };
                self.file.write_all(&bytes)?;
                carry = Some((first, offset | M_CHILD_FLAG));
                root_offset = offset;
            }
            level += 1;
        }

        let md = metadata.encode()?;
        self.file.write_all(&md)?;
        let footer = Footer {
            root_offset,
            msize: self.msize as u64,
            zsize: self.zsize as u64,
            mdlen: md.len() as u64,
            count: self.count,
            flags: 0,
        };
        footer.write_to(&mut self.file)?;
        self.file.sync_data()?;
        info!(
            "{}: built {} entries, {} bytes",
            self.name, self.count, self.file.pos
        );
        Ok(self.count)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn maxseqno(&self) -> u64 {
        self.maxseqno
    }

    /// Remove the partial file after a failed build.
    pub fn discard(self) -> Result<()> {
        std::fs::remove_file(&self.filepath)?;
        Ok(())
    }
}
