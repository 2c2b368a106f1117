use crate::error::Error;
use crate::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Which red-black tree variant backs the memory tier.
///
/// `Llrb` captures tree snapshots only at quiesce points demanded by the
/// engine (flush), `Mvcc` additionally runs the background snapshot ticker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemStore {
    Llrb,
    Mvcc,
}

/// Engine settings. All fields have defaults except `disk_paths`, which
/// must name at least one directory.
#[derive(Clone, Debug)]
pub struct Options {
    pub memstore: MemStore,
    /// Data-greater-than-memory mode: deletes become tombstones.
    pub dgm: bool,
    /// Reserved cache-behaviour hint.
    pub workingset: bool,
    /// Size-ratio threshold for flush and compact decisions.
    pub ratio: f64,
    /// Maximum age of the newest disk level before a flush is forced.
    pub period: Duration,
    /// Compactor evaluation interval.
    pub compact_tick: Duration,
    /// Memory budget for keys in the memtree.
    pub key_capacity: usize,
    /// Memory budget for values in the memtree.
    pub val_capacity: usize,
    /// Snapshot ticker interval for the mvcc memtree.
    pub snapshot_tick: Duration,
    /// Slab allocator strategy; `"flist"` is the only one implemented.
    pub allocator: String,
    /// Directories holding disk level files.
    pub disk_paths: Vec<PathBuf>,
    /// Interior block size of disk files.
    pub msize: usize,
    /// Leaf block size of disk files.
    pub zsize: usize,
    /// Memory-map disk files instead of positional reads.
    pub mmap: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            memstore: MemStore::Mvcc,
            dgm: false,
            workingset: false,
            ratio: 0.25,
            period: Duration::from_secs(100),
            compact_tick: Duration::from_secs(1),
            key_capacity: 1024 * 1024 * 1024,
            val_capacity: 1024 * 1024 * 1024,
            snapshot_tick: Duration::from_millis(4),
            allocator: "flist".to_string(),
            disk_paths: Vec::new(),
            msize: 4096,
            zsize: 4096,
            mmap: false,
        }
    }
}

/// Smallest usable disk block; a block must hold its slot array and at
/// least one entry.
const MIN_BLOCK_SIZE: usize = 512;

impl Options {
    pub fn with_paths(paths: Vec<PathBuf>) -> Options {
        Options {
            disk_paths: paths,
            ..Options::default()
        }
    }

    /// Combined memtree memory budget.
    pub fn memcapacity(&self) -> usize {
        self.key_capacity + self.val_capacity
    }

    pub fn validate(&self) -> Result<()> {
        if self.disk_paths.is_empty() {
            return Err(Error::InvalidConfig("no disk paths configured".into()));
        }
        if self.allocator != "flist" {
            let msg = format!("unknown allocator {:?}", self.allocator);
            return Err(Error::InvalidConfig(msg));
        }
        if !(self.ratio > 0.0) {
            return Err(Error::InvalidConfig(format!("ratio {} <= 0", self.ratio)));
        }
        if self.msize < MIN_BLOCK_SIZE || self.zsize < MIN_BLOCK_SIZE {
            let msg = format!(
                "block sizes {}/{} below minimum {}",
                self.msize, self.zsize, MIN_BLOCK_SIZE
            );
            return Err(Error::InvalidConfig(msg));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let mut opts = Options::default();
        assert!(matches!(opts.validate(), Err(Error::InvalidConfig(_))));
        opts.disk_paths.push(PathBuf::from("/tmp"));
        opts.validate().unwrap();
        assert_eq!(opts.memcapacity(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_bad_settings() {
        let mut opts = Options::with_paths(vec![PathBuf::from("/tmp")]);
        opts.allocator = "slab".to_string();
        assert!(opts.validate().is_err());

        let mut opts = Options::with_paths(vec![PathBuf::from("/tmp")]);
        opts.ratio = 0.0;
        assert!(opts.validate().is_err());

        let mut opts = Options::with_paths(vec![PathBuf::from("/tmp")]);
        opts.zsize = 128;
        assert!(opts.validate().is_err());
    }
}
