pub mod alloc;
pub mod clock;
pub mod disk;
pub mod engine;
mod error;
pub mod ioutils;
pub mod llrb;
pub mod merge;
pub mod options;

pub use engine::TierDb;
pub use error::Error;
pub use options::{MemStore, Options};

pub type Result<T> = std::result::Result<T, error::Error>;

/// Inclusiveness of the two bounds of a range operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Incl {
    Both,
    Low,
    High,
    None,
}

/// Raw key bytes, ordered by unsigned lexicographic comparison.
pub type Key = Vec<u8>;
/// Raw value bytes.
pub type Value = Vec<u8>;

/// One record as seen by readers and iterators. A tombstone has
/// `deleted = true` and an empty value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
    pub seqno: u64,
    pub deleted: bool,
}

impl Entry {
    pub fn new(key: Key, value: Value, seqno: u64) -> Entry {
        Entry {
            key,
            value,
            seqno,
            deleted: false,
        }
    }

    pub fn tombstone(key: Key, seqno: u64) -> Entry {
        Entry {
            key,
            value: Vec::new(),
            seqno,
            deleted: true,
        }
    }

    /// Bytes consumed by key and value payloads.
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len()
    }
}
