//! Copy-on-write left-leaning red-black tree. Every node mutated on the
//! path from the root is cloned first; originals are appended to the
//! writer's reclaim list and stay reachable from older roots until the
//! owning snapshot drains.

use crate::alloc::Arena;
use crate::error::Error;
use crate::llrb::node::{is_red, node_size, Node, NodePtr, MAX_KEY_SIZE};
use crate::llrb::TreeStats;
use crate::{Entry, Result};
use std::cmp::Ordering;
use std::ptr;

/// Smallest node-arena block; a multiple of 32 covering the node header.
const NODE_MIN_BLOCK: usize = 64;
/// Largest node-arena block; node header plus a maximum sized key,
/// rounded up to a multiple of 32.
const NODE_MAX_BLOCK: usize = (std::mem::size_of::<Node>() + MAX_KEY_SIZE + 31) / 32 * 32;
const VAL_MIN_BLOCK: usize = 32;
const VAL_MAX_BLOCK: usize = 1024 * 1024;

/// A retired allocation, freed once the snapshot holding it drains.
pub enum Reclaim {
    Node(NodePtr),
    Value(*mut u8),
}

unsafe impl Send for Reclaim {}

/// Writer-side state: the slab arenas, the current reclaim batch and the
/// running statistics. Owned by the single writer thread.
pub struct TreeCore {
    nodearena: Arena,
    valarena: Arena,
    reclaim: Vec<Reclaim>,
    // nodes created or cloned by the mutation in progress
    fresh: Vec<NodePtr>,
    pub stats: TreeStats,
}

unsafe impl Send for TreeCore {}

impl TreeCore {
    pub fn new(key_capacity: usize, val_capacity: usize) -> Result<TreeCore> {
        Ok(TreeCore {
            nodearena: Arena::new(NODE_MIN_BLOCK, NODE_MAX_BLOCK, key_capacity)?,
            valarena: Arena::new(VAL_MIN_BLOCK, VAL_MAX_BLOCK, val_capacity)?,
            reclaim: Vec::new(),
            fresh: Vec::new(),
            stats: TreeStats::default(),
        })
    }

    /// Reject entries the slab schedule cannot hold, before any mutation.
    pub fn check_limits(&self, key: &[u8], value_len: usize) -> Result<()> {
        if key.len() > MAX_KEY_SIZE || node_size(key.len()) > self.nodearena.maxblock() {
            return Err(Error::EntryTooLarge);
        }
        if value_len > self.valarena.maxblock() {
            return Err(Error::EntryTooLarge);
        }
        Ok(())
    }

    pub fn footprint(&self) -> usize {
        self.nodearena.allocated() + self.valarena.allocated()
    }

    pub fn take_reclaim(&mut self) -> Vec<Reclaim> {
        std::mem::take(&mut self.reclaim)
    }

    pub fn free_reclaimed(&mut self, items: Vec<Reclaim>) {
        for item in items {
            match item {
                Reclaim::Node(nd) => self.nodearena.free(nd as *mut u8),
                Reclaim::Value(v) => self.valarena.free(v),
            }
            self.stats.n_frees += 1;
        }
    }

    /// Clear dirty marks left by the mutation in progress. Call after the
    /// new root has been fixed up, before publishing it.
    pub fn seal_mutation(&mut self) {
        for nd in self.fresh.drain(..) {
            unsafe { (*nd).clear_dirty() };
        }
    }

    //---- allocation helpers

    fn alloc_node(&mut self, klen: usize) -> NodePtr {
        match self.nodearena.alloc(node_size(klen)) {
            Some(ptr) => ptr as NodePtr,
            None => panic!("node allocation failed for key of {} bytes", klen),
        }
    }

    unsafe fn newnode(&mut self, key: &[u8], value: Option<&[u8]>, seqno: u64) -> NodePtr {
        let nd = self.alloc_node(key.len());
        Node::init(nd, key, seqno);
        if let Some(value) = value {
            self.set_node_value(nd, Some(value));
        }
        self.stats.n_nodes += 1;
        self.stats.keymemory += key.len() as i64;
        self.fresh.push(nd);
        nd
    }

    /// Replace the node's value allocation, retiring the old one into the
    /// current reclaim batch.
    unsafe fn set_node_value(&mut self, nd: NodePtr, value: Option<&[u8]>) {
        if !(*nd).value.is_null() {
            self.reclaim.push(Reclaim::Value((*nd).value));
            self.stats.valmemory -= (*nd).vlen as i64;
            (*nd).value = ptr::null_mut();
            (*nd).vlen = 0;
        }
        if let Some(value) = value {
            if !value.is_empty() {
                let vptr = match self.valarena.alloc(value.len()) {
                    Some(vptr) => vptr,
                    None => panic!("value allocation failed for {} bytes", value.len()),
                };
                ptr::copy_nonoverlapping(value.as_ptr(), vptr, value.len());
                (*nd).value = vptr;
                (*nd).vlen = value.len() as u32;
            }
            self.stats.valmemory += value.len() as i64;
        }
    }

    /// Copy-on-write: nodes already dirty belong to the mutation in
    /// progress and are returned as-is.
    unsafe fn cow(&mut self, nd: NodePtr) -> NodePtr {
        debug_assert!(!nd.is_null());
        if (*nd).is_dirty() {
            return nd;
        }
        let newnd = self.alloc_node((*nd).keysize());
        Node::copy_to(nd, newnd);
        (*newnd).set_dirty();
        self.stats.n_clones += 1;
        self.reclaim.push(Reclaim::Node(nd));
        self.stats.n_reclaims += 1;
        self.fresh.push(newnd);
        newnd
    }

    /// A fresh physical copy of `src` counted as a clone; the caller is
    /// responsible for retiring whichever node it replaces.
    unsafe fn copy_of(&mut self, src: NodePtr) -> NodePtr {
        let newnd = self.alloc_node((*src).keysize());
        Node::copy_to(src, newnd);
        (*newnd).set_dirty();
        self.stats.n_clones += 1;
        self.fresh.push(newnd);
        newnd
    }

    unsafe fn retire_node(&mut self, nd: NodePtr) {
        self.reclaim.push(Reclaim::Node(nd));
        self.stats.n_reclaims += 1;
    }

    unsafe fn retire_node_and_value(&mut self, nd: NodePtr) {
        if !(*nd).value.is_null() {
            self.reclaim.push(Reclaim::Value((*nd).value));
            self.stats.valmemory -= (*nd).vlen as i64;
        }
        self.stats.keymemory -= (*nd).keysize() as i64;
        self.retire_node(nd);
    }

    //---- rotations

    unsafe fn rotate_left(&mut self, h_: NodePtr) -> NodePtr {
        let h = self.cow(h_);
        debug_assert!(is_red((*h).right));
        let x = self.cow((*h).right);
        (*h).right = (*x).left;
        (*x).left = h;
        if (*h).is_black() {
            (*x).set_black();
        } else {
            (*x).set_red();
        }
        (*h).set_red();
        x
    }

    unsafe fn rotate_right(&mut self, h_: NodePtr) -> NodePtr {
        let h = self.cow(h_);
        debug_assert!(is_red((*h).left));
        let x = self.cow((*h).left);
        (*h).left = (*x).right;
        (*x).right = h;
        if (*h).is_black() {
            (*x).set_black();
        } else {
            (*x).set_red();
        }
        (*h).set_red();
        x
    }

    unsafe fn flip_colors(&mut self, h_: NodePtr) -> NodePtr {
        let h = self.cow(h_);
        (*h).toggle_link();
        if !(*h).left.is_null() {
            let l = self.cow((*h).left);
            (*l).toggle_link();
            (*h).left = l;
        }
        if !(*h).right.is_null() {
            let r = self.cow((*h).right);
            (*r).toggle_link();
            (*h).right = r;
        }
        h
    }

    unsafe fn fixup(&mut self, mut nd: NodePtr) -> NodePtr {
        if is_red((*nd).right) {
            nd = self.rotate_left(nd);
        }
        if is_red((*nd).left) && is_red((*(*nd).left).left) {
            nd = self.rotate_right(nd);
        }
        if is_red((*nd).left) && is_red((*nd).right) {
            nd = self.flip_colors(nd);
        }
        nd
    }

    unsafe fn move_red_left(&mut self, h_: NodePtr) -> NodePtr {
        let mut h = self.flip_colors(h_);
        if !(*h).right.is_null() && is_red((*(*h).right).left) {
            (*h).right = self.rotate_right((*h).right);
            h = self.rotate_left(h);
            h = self.flip_colors(h);
        }
        h
    }

    unsafe fn move_red_right(&mut self, h_: NodePtr) -> NodePtr {
        let mut h = self.flip_colors(h_);
        if !(*h).left.is_null() && is_red((*(*h).left).left) {
            h = self.rotate_right(h);
            h = self.flip_colors(h);
        }
        h
    }

    //---- upsert

    /// Insert or update; returns the new root and the previous entry.
    pub unsafe fn upsert(
        &mut self,
        root: NodePtr,
        key: &[u8],
        value: &[u8],
        seqno: u64,
    ) -> (NodePtr, Option<Entry>) {
        let (root, old) = self.do_upsert(root, key, value, seqno);
        (*root).set_black();
        self.seal_mutation();
        (root, old)
    }

    unsafe fn do_upsert(
        &mut self,
        nd: NodePtr,
        key: &[u8],
        value: &[u8],
        seqno: u64,
    ) -> (NodePtr, Option<Entry>) {
        if nd.is_null() {
            self.stats.n_inserts += 1;
            self.stats.n_count += 1;
            return (self.newnode(key, Some(value), seqno), None);
        }
        let nd = self.cow(nd);
        let old = match key.cmp((*nd).key()) {
            Ordering::Less => {
                let (l, old) = self.do_upsert((*nd).left, key, value, seqno);
                (*nd).left = l;
                old
            }
            Ordering::Greater => {
                let (r, old) = self.do_upsert((*nd).right, key, value, seqno);
                (*nd).right = r;
                old
            }
            Ordering::Equal => {
                let old = (*nd).entry();
                if (*nd).is_deleted() {
                    (*nd).clear_deleted();
                    (*nd).set_deadseq(0);
                }
                (*nd).set_bornseq(seqno);
                self.set_node_value(nd, Some(value));
                self.stats.n_updates += 1;
                Some(old)
            }
        };
        (self.fixup(nd), old)
    }

    //---- delete, tombstone flavour

    /// Write a tombstone for `key`, inserting one if the key is absent.
    pub unsafe fn lsm_delete(
        &mut self,
        root: NodePtr,
        key: &[u8],
        seqno: u64,
    ) -> (NodePtr, Option<Entry>) {
        let (root, old) = self.do_lsm_delete(root, key, seqno);
        (*root).set_black();
        self.seal_mutation();
        (root, old)
    }

    unsafe fn do_lsm_delete(
        &mut self,
        nd: NodePtr,
        key: &[u8],
        seqno: u64,
    ) -> (NodePtr, Option<Entry>) {
        if nd.is_null() {
            let newnd = self.newnode(key, None, 0);
            (*newnd).set_deleted();
            (*newnd).set_deadseq(seqno);
            self.stats.n_inserts += 1;
            self.stats.n_count += 1;
            return (newnd, None);
        }
        let nd = self.cow(nd);
        let old = match key.cmp((*nd).key()) {
            Ordering::Less => {
                let (l, old) = self.do_lsm_delete((*nd).left, key, seqno);
                (*nd).left = l;
                old
            }
            Ordering::Greater => {
                let (r, old) = self.do_lsm_delete((*nd).right, key, seqno);
                (*nd).right = r;
                old
            }
            Ordering::Equal => {
                let old = (*nd).entry();
                if !(*nd).is_deleted() {
                    (*nd).set_deleted();
                    self.set_node_value(nd, None);
                }
                (*nd).set_deadseq(seqno);
                self.stats.n_updates += 1;
                Some(old)
            }
        };
        (self.fixup(nd), old)
    }

    //---- delete, structural flavour

    /// Remove `key` from the tree. The caller must have verified the key
    /// is present.
    pub unsafe fn delete(&mut self, root: NodePtr, key: &[u8]) -> (NodePtr, Option<Entry>) {
        let (root, removed) = self.do_delete(root, key);
        if !root.is_null() {
            (*root).set_black();
        }
        if removed.is_some() {
            self.stats.n_deletes += 1;
            self.stats.n_count -= 1;
        }
        self.seal_mutation();
        (root, removed)
    }

    unsafe fn do_delete(&mut self, nd: NodePtr, key: &[u8]) -> (NodePtr, Option<Entry>) {
        let mut h = self.cow(nd);
        if key.cmp((*h).key()) == Ordering::Less {
            if (*h).left.is_null() {
                return (self.fixup(h), None);
            }
            if !is_red((*h).left) && !is_red((*(*h).left).left) {
                h = self.move_red_left(h);
            }
            let (l, removed) = self.do_delete((*h).left, key);
            (*h).left = l;
            (self.fixup(h), removed)
        } else {
            if is_red((*h).left) {
                h = self.rotate_right(h);
            }
            if key == (*h).key() && (*h).right.is_null() {
                let removed = (*h).entry();
                self.retire_node_and_value(h);
                return (ptr::null_mut(), Some(removed));
            }
            if (*h).right.is_null() {
                // key absent below this leaf
                return (self.fixup(h), None);
            }
            if !is_red((*h).right) && !is_red((*(*h).right).left) {
                h = self.move_red_right(h);
            }
            if key == (*h).key() {
                let removed = (*h).entry();
                let succ = min_node((*h).right);
                // the replacement carries the successor's key and value
                // and takes over h's links and colour
                let repl = self.copy_of(succ);
                let (r, dropped) = self.delete_min((*h).right);
                (*repl).left = (*h).left;
                (*repl).right = r;
                if (*h).is_black() {
                    (*repl).set_black();
                } else {
                    (*repl).set_red();
                }
                // the successor's value allocation now belongs to repl
                self.retire_node(dropped);
                self.retire_node_and_value(h);
                (self.fixup(repl), Some(removed))
            } else {
                let (r, removed) = self.do_delete((*h).right, key);
                (*h).right = r;
                (self.fixup(h), removed)
            }
        }
    }

    /// Unlink the leftmost node; returns the new subtree and the removed
    /// (already copy-on-write) node, whose retirement the caller owns.
    unsafe fn delete_min(&mut self, nd: NodePtr) -> (NodePtr, NodePtr) {
        let mut h = self.cow(nd);
        if (*h).left.is_null() {
            return (ptr::null_mut(), h);
        }
        if !is_red((*h).left) && !is_red((*(*h).left).left) {
            h = self.move_red_left(h);
        }
        let (l, removed) = self.delete_min((*h).left);
        (*h).left = l;
        (self.fixup(h), removed)
    }
}

//---- read-only traversals, shared by the writer and lock-free readers

/// # Safety
/// `nd` must be null or the root of a live tree.
pub unsafe fn get_node(mut nd: NodePtr, key: &[u8]) -> NodePtr {
    while !nd.is_null() {
        match key.cmp((*nd).key()) {
            Ordering::Less => nd = (*nd).left,
            Ordering::Greater => nd = (*nd).right,
            Ordering::Equal => return nd,
        }
    }
    ptr::null_mut()
}

/// Leftmost node, tombstones included.
pub unsafe fn min_node(mut nd: NodePtr) -> NodePtr {
    debug_assert!(!nd.is_null());
    while !(*nd).left.is_null() {
        nd = (*nd).left;
    }
    nd
}

/// Smallest live entry, skipping tombstones.
pub unsafe fn min_live(nd: NodePtr) -> NodePtr {
    if nd.is_null() {
        return ptr::null_mut();
    }
    let left = min_live((*nd).left);
    if !left.is_null() {
        return left;
    }
    if !(*nd).is_deleted() {
        return nd;
    }
    min_live((*nd).right)
}

/// Largest live entry, skipping tombstones.
pub unsafe fn max_live(nd: NodePtr) -> NodePtr {
    if nd.is_null() {
        return ptr::null_mut();
    }
    let right = max_live((*nd).right);
    if !right.is_null() {
        return right;
    }
    if !(*nd).is_deleted() {
        return nd;
    }
    max_live((*nd).left)
}

//---- the eight range walkers: {forward, reverse} x {both, high, low, none}

type WalkFn<'a> = &'a mut dyn FnMut(&Node) -> bool;

pub unsafe fn range_ge_le(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() < lo) {
        return range_ge_le((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() > hi) {
        return range_ge_le((*nd).left, lo, hi, callb);
    }
    range_ge_le((*nd).left, lo, hi, callb) && callb(&*nd) && range_ge_le((*nd).right, lo, hi, callb)
}

pub unsafe fn range_gt_le(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() <= lo) {
        return range_gt_le((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() > hi) {
        return range_gt_le((*nd).left, lo, hi, callb);
    }
    range_gt_le((*nd).left, lo, hi, callb) && callb(&*nd) && range_gt_le((*nd).right, lo, hi, callb)
}

pub unsafe fn range_ge_lt(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() < lo) {
        return range_ge_lt((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() >= hi) {
        return range_ge_lt((*nd).left, lo, hi, callb);
    }
    range_ge_lt((*nd).left, lo, hi, callb) && callb(&*nd) && range_ge_lt((*nd).right, lo, hi, callb)
}

pub unsafe fn range_gt_lt(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() <= lo) {
        return range_gt_lt((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() >= hi) {
        return range_gt_lt((*nd).left, lo, hi, callb);
    }
    range_gt_lt((*nd).left, lo, hi, callb) && callb(&*nd) && range_gt_lt((*nd).right, lo, hi, callb)
}

pub unsafe fn reverse_ge_le(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() < lo) {
        return reverse_ge_le((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() > hi) {
        return reverse_ge_le((*nd).left, lo, hi, callb);
    }
    reverse_ge_le((*nd).right, lo, hi, callb)
        && callb(&*nd)
        && reverse_ge_le((*nd).left, lo, hi, callb)
}

pub unsafe fn reverse_gt_le(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() <= lo) {
        return reverse_gt_le((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() > hi) {
        return reverse_gt_le((*nd).left, lo, hi, callb);
    }
    reverse_gt_le((*nd).right, lo, hi, callb)
        && callb(&*nd)
        && reverse_gt_le((*nd).left, lo, hi, callb)
}

pub unsafe fn reverse_ge_lt(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() < lo) {
        return reverse_ge_lt((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() >= hi) {
        return reverse_ge_lt((*nd).left, lo, hi, callb);
    }
    reverse_ge_lt((*nd).right, lo, hi, callb)
        && callb(&*nd)
        && reverse_ge_lt((*nd).left, lo, hi, callb)
}

pub unsafe fn reverse_gt_lt(
    nd: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    callb: WalkFn,
) -> bool {
    if nd.is_null() {
        return true;
    }
    if lo.map_or(false, |lo| (*nd).key() <= lo) {
        return reverse_gt_lt((*nd).right, lo, hi, callb);
    }
    if hi.map_or(false, |hi| (*nd).key() >= hi) {
        return reverse_gt_lt((*nd).left, lo, hi, callb);
    }
    reverse_gt_lt((*nd).right, lo, hi, callb)
        && callb(&*nd)
        && reverse_gt_lt((*nd).left, lo, hi, callb)
}

/// Route a range request to the walker matching its direction and bound
/// inclusiveness.
pub(crate) unsafe fn dispatch_walk(
    root: NodePtr,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
    incl: crate::Incl,
    reverse: bool,
    callb: WalkFn,
) -> bool {
    use crate::Incl;
    match (reverse, incl) {
        (false, Incl::Both) => range_ge_le(root, lo, hi, callb),
        (false, Incl::High) => range_gt_le(root, lo, hi, callb),
        (false, Incl::Low) => range_ge_lt(root, lo, hi, callb),
        (false, Incl::None) => range_gt_lt(root, lo, hi, callb),
        (true, Incl::Both) => reverse_ge_le(root, lo, hi, callb),
        (true, Incl::High) => reverse_gt_le(root, lo, hi, callb),
        (true, Incl::Low) => reverse_ge_lt(root, lo, hi, callb),
        (true, Incl::None) => reverse_gt_lt(root, lo, hi, callb),
    }
}

//---- validation

/// Walk the whole tree checking LLRB shape, ordering, the height bound
/// and the statistics identities.
pub unsafe fn validate_tree(root: NodePtr, stats: &TreeStats) -> Result<()> {
    if is_red(root) {
        return Err(Error::corruption("root is red"));
    }
    let mut walk = Walk::default();
    walk.descend(root, 1, 0)?;
    if walk.count != stats.n_count {
        let msg = format!("walked {} entries, stats say {}", walk.count, stats.n_count);
        return Err(Error::corruption(msg));
    }
    if walk.keymemory != stats.keymemory || walk.valmemory != stats.valmemory {
        let msg = format!(
            "memory accounting {}/{} != walked {}/{}",
            stats.keymemory, stats.valmemory, walk.keymemory, walk.valmemory
        );
        return Err(Error::corruption(msg));
    }
    if walk.count >= 9 {
        let bound = 3.0 * (walk.count as f64).log2();
        if walk.maxdepth as f64 > bound {
            let msg = format!("height {} exceeds 3*log2({})", walk.maxdepth, walk.count);
            return Err(Error::corruption(msg));
        }
    }
    stats.validate()
}

#[derive(Default)]
struct Walk {
    count: i64,
    keymemory: i64,
    valmemory: i64,
    maxdepth: u32,
    blackheight: Option<u32>,
}

impl Walk {
    unsafe fn descend(&mut self, nd: NodePtr, depth: u32, blacks: u32) -> Result<()> {
        if nd.is_null() {
            match self.blackheight {
                None => self.blackheight = Some(blacks),
                Some(h) if h != blacks => {
                    let msg = format!("black height {} != {}", blacks, h);
                    return Err(Error::corruption(msg));
                }
                Some(_) => {}
            }
            return Ok(());
        }
        if is_red(nd) && (is_red((*nd).left) || is_red((*nd).right)) {
            return Err(Error::corruption("red node with red child"));
        }
        if is_red((*nd).right) {
            return Err(Error::corruption("right-leaning red link"));
        }
        if !(*nd).left.is_null() && (*(*nd).left).key() >= (*nd).key() {
            return Err(Error::corruption("left child out of order"));
        }
        if !(*nd).right.is_null() && (*(*nd).right).key() <= (*nd).key() {
            return Err(Error::corruption("right child out of order"));
        }
        self.count += 1;
        self.keymemory += (*nd).keysize() as i64;
        self.valmemory += (*nd).vlen as i64;
        self.maxdepth = self.maxdepth.max(depth);
        let blacks = if (*nd).is_black() { blacks + 1 } else { blacks };
        self.descend((*nd).left, depth + 1, blacks)?;
        self.descend((*nd).right, depth + 1, blacks)
    }
}
