//! In-memory left-leaning red-black tree with MVCC snapshots. A single
//! writer thread serializes mutations through a command channel; readers
//! traverse lock-free off the published root.

mod iter;
mod node;
mod snapshot;
mod tree;
mod writer;

pub use iter::TreeIter;
pub use node::MAX_KEY_SIZE;
pub use snapshot::TreeSnapshot;
pub use writer::{Tree, TreeOptions};

use crate::error::Error;
use crate::Result;

/// Writer statistics, captured into every tree snapshot. The counters
/// satisfy, at every capture:
///   n_count == n_inserts - n_deletes == n_nodes + n_clones - n_reclaims
///   n_deletes == n_reclaims - n_clones
#[derive(Clone, Debug, Default)]
pub struct TreeStats {
    /// Entries in the tree, tombstones included.
    pub n_count: i64,
    pub n_inserts: i64,
    pub n_updates: i64,
    pub n_deletes: i64,
    /// Nodes created fresh (as opposed to cloned).
    pub n_nodes: i64,
    /// Slab blocks handed back so far.
    pub n_frees: i64,
    pub n_clones: i64,
    /// Nodes retired into reclaim lists.
    pub n_reclaims: i64,
    pub keymemory: i64,
    pub valmemory: i64,
}

impl TreeStats {
    pub fn validate(&self) -> Result<()> {
        if self.n_count != self.n_inserts - self.n_deletes {
            let msg = format!(
                "n_count:{} != n_inserts:{} - n_deletes:{}",
                self.n_count, self.n_inserts, self.n_deletes
            );
            return Err(Error::corruption(msg));
        }
        if self.n_inserts != self.n_nodes {
            let msg = format!("n_inserts:{} != n_nodes:{}", self.n_inserts, self.n_nodes);
            return Err(Error::corruption(msg));
        }
        if self.n_count != self.n_nodes + self.n_clones - self.n_reclaims {
            let msg = format!(
                "n_count:{} != n_nodes:{} + n_clones:{} - n_reclaims:{}",
                self.n_count, self.n_nodes, self.n_clones, self.n_reclaims
            );
            return Err(Error::corruption(msg));
        }
        if self.n_deletes != self.n_reclaims - self.n_clones {
            let msg = format!(
                "n_deletes:{} != n_reclaims:{} - n_clones:{}",
                self.n_deletes, self.n_reclaims, self.n_clones
            );
            return Err(Error::corruption(msg));
        }
        Ok(())
    }
}
