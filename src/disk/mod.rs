//! Immutable sorted B+-tree files, one per disk level.
//!
//! A file is a sequence of fixed-size blocks followed by a JSON metadata
//! trailer and a fixed footer:
//!
//! ```text
//! +--------------------------+ (offset 0)
//! | Leaf Block (zsize)       |<--+
//! +--------------------------+   |
//! | ...                      |   |
//! +--------------------------+   |
//! | Interior Block (msize)   |---+
//! +--------------------------+   |
//! | Root Interior Block      |---+
//! +--------------------------+
//! | Metadata (JSON)          |
//! +--------------------------+
//! | Footer (fixed, 56 bytes) |
//! +--------------------------+
//! ```
//!
//! ## Block
//!
//! ```text
//! +-------------------------------------------------------+
//! | count | offset 1 .. offset n | entry 1 .. entry n | 0 |
//! +-------------------------------------------------------+
//! \-------/\--------------------/
//!   u32        u32 each, block-relative
//! ```
//!
//! Leaf entry: `u16 klen | key | u64 vfield | u32 vlen | value` where
//! `vfield = seqno << 2 | tombstone << 1` (bit 0 clear). Interior entry:
//! `u16 klen | key | u64 child` where bit 0 of `child` marks an interior
//! child. All fixed-width integers are big-endian.

mod block;
mod build;
mod footer;
mod snapshot;

pub use block::Block;
pub use build::Builder;
pub use footer::{Footer, Metadata};
pub use snapshot::{DiskIter, DiskSnapshot};

use rand::Rng;
use std::path::{Path, PathBuf};

/// Fixed number of disk levels; 0 is most recent, 15 oldest and largest.
pub const NLEVELS: usize = 16;

/// File name for a disk level: `<engine>-<level>-<version>-<uuid>`.
pub fn level_name(engine: &str, level: usize, version: u64, uuid: &str) -> String {
    format!("{}-{}-{}-{}", engine, level, version, uuid)
}

/// Parse a level file name back into `(level, version, uuid)`. Returns
/// None for anything that is not one of this engine's files.
pub fn parse_level_name(engine: &str, filename: &str) -> Option<(usize, u64, String)> {
    let parts: Vec<&str> = filename.split('-').collect();
    if parts.len() != 4 || parts[0] != engine {
        return None;
    }
    let level = parts[1].parse::<usize>().ok()?;
    let version = parts[2].parse::<u64>().ok()?;
    if level >= NLEVELS || parts[3].is_empty() {
        return None;
    }
    Some((level, version, parts[3].to_string()))
}

/// 16 hex characters of randomness to keep rebuilt level files distinct.
pub fn random_uuid() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// The directory a new file for `level` is built in.
pub fn build_path(paths: &[PathBuf], level: usize) -> &Path {
    &paths[level % paths.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_name_round_trip() {
        let name = level_name("dbx", 15, 3, "00ff00ff00ff00ff");
        assert_eq!(name, "dbx-15-3-00ff00ff00ff00ff");
        let (level, version, uuid) = parse_level_name("dbx", &name).unwrap();
        assert_eq!((level, version, uuid.as_str()), (15, 3, "00ff00ff00ff00ff"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_level_name("dbx", "dbx-15-3").is_none());
        assert!(parse_level_name("dbx", "other-15-3-aa").is_none());
        assert!(parse_level_name("dbx", "dbx-x-3-aa").is_none());
        assert!(parse_level_name("dbx", "dbx-15-y-aa").is_none());
        assert!(parse_level_name("dbx", "dbx-16-3-aa").is_none());
        assert!(parse_level_name("dbx", "dbx-15-3-").is_none());
        assert!(parse_level_name("dbx", "garbage").is_none());
    }

    #[test]
    fn test_uuid_shape() {
        let uuid = random_uuid();
        assert_eq!(uuid.len(), 16);
        assert!(uuid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_uuid(), random_uuid());
    }
}
