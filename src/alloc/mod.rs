//! Slab allocator: power-law sized pools of fixed blocks over native
//! memory, with a bitmap free list per pool.

mod pool;

pub use pool::Pool;

use crate::error::Error;
use crate::Result;

/// Expected memory utilization; the block size schedule is chosen so that
/// rounding a request up to the next size wastes at most this fraction.
pub const MEM_UTILIZATION: f64 = 0.95;

const SIZE_INTERVAL: usize = 32;
const MAX_POOLS: usize = 256;
const MAX_ARENA_SIZE: usize = 1024 * 1024 * 1024 * 1024; // 1TB

/// An arena owns the size schedule and, per schedule size, an ordered list
/// of pools. Pools are kept sorted by base pointer so a free-pointer can
/// locate its pool by binary search.
pub struct Arena {
    minblock: usize,
    maxblock: usize,
    capacity: usize,
    blocksizes: Vec<usize>,
    pools: Vec<Vec<Pool>>,
    // (base, schedule index, pool index), sorted by base
    ptrindex: Vec<(usize, usize, usize)>,
}

impl Arena {
    pub fn new(minblock: usize, maxblock: usize, capacity: usize) -> Result<Arena> {
        let blocksizes = block_sizes(minblock, maxblock)?;
        if blocksizes.len() > MAX_POOLS || capacity > MAX_ARENA_SIZE {
            let msg = format!("arena would need more than {} pools", MAX_POOLS);
            return Err(Error::InvalidConfig(msg));
        }
        let pools = blocksizes.iter().map(|_| Vec::new()).collect();
        Ok(Arena {
            minblock,
            maxblock,
            capacity,
            blocksizes,
            pools,
            ptrindex: Vec::new(),
        })
    }

    /// Returns a block of at least `n` bytes, or `None` when `n` exceeds
    /// the largest schedule size.
    pub fn alloc(&mut self, n: usize) -> Option<*mut u8> {
        if n > self.maxblock {
            return None;
        }
        let sidx = suitable_size(&self.blocksizes, n);
        let size = self.blocksizes[sidx];
        for pool in self.pools[sidx].iter_mut() {
            if let Some(ptr) = pool.alloc() {
                return Some(ptr);
            }
        }
        let mut numblocks = (self.capacity / self.blocksizes.len()) / size;
        if (numblocks & 0x7) > 0 {
            numblocks = ((numblocks >> 3) + 1) << 3;
        }
        if numblocks == 0 {
            numblocks = 8;
        }
        let mut pool = Pool::new(size, numblocks);
        let ptr = pool.alloc();
        self.pools[sidx].push(pool);
        self.pools[sidx].sort_by_key(|p| p.base() as usize);
        self.reindex();
        ptr
    }

    /// Hand a block back. The pointer must have come from `alloc`; anything
    /// else is an unrecoverable bookkeeping violation.
    pub fn free(&mut self, ptr: *mut u8) {
        let p = ptr as usize;
        let at = match self.ptrindex.binary_search_by(|probe| probe.0.cmp(&p)) {
            Ok(at) => at,
            Err(0) => panic!("arena.free(): pointer below every pool"),
            Err(at) => at - 1,
        };
        let (_, sidx, pidx) = self.ptrindex[at];
        let pool = &mut self.pools[sidx][pidx];
        if !pool.contains(ptr) {
            panic!("arena.free(): pointer does not belong to any pool");
        }
        pool.free(ptr);
    }

    fn reindex(&mut self) {
        self.ptrindex.clear();
        for (sidx, pools) in self.pools.iter().enumerate() {
            for (pidx, pool) in pools.iter().enumerate() {
                self.ptrindex.push((pool.base() as usize, sidx, pidx));
            }
        }
        self.ptrindex.sort_by_key(|entry| entry.0);
    }

    /// The schedule size a request of `n` bytes rounds up to.
    pub fn slabsize(&self, n: usize) -> usize {
        self.blocksizes[suitable_size(&self.blocksizes, n)]
    }

    pub fn allocated(&self) -> usize {
        self.pools
            .iter()
            .flatten()
            .map(|pool| pool.allocated())
            .sum()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.allocated()
    }

    pub fn memory(&self) -> usize {
        self.pools.iter().flatten().map(|pool| pool.memory()).sum()
    }

    #[inline]
    pub fn minblock(&self) -> usize {
        self.minblock
    }

    #[inline]
    pub fn maxblock(&self) -> usize {
        self.maxblock
    }
}

/// Index into `sizes` of the smallest size >= `n`.
fn suitable_size(sizes: &[usize], n: usize) -> usize {
    match sizes.binary_search(&n) {
        Ok(at) => at,
        Err(at) => at,
    }
}

/// Geometric progression of block sizes from `minblock` to `maxblock`
/// such that rounding up wastes at most `1 - MEM_UTILIZATION`.
pub fn block_sizes(minblock: usize, maxblock: usize) -> Result<Vec<usize>> {
    if maxblock < minblock {
        let msg = format!("minblock {} > maxblock {}", minblock, maxblock);
        return Err(Error::InvalidConfig(msg));
    } else if (minblock % SIZE_INTERVAL) != 0 || (maxblock % SIZE_INTERVAL) != 0 {
        let msg = format!("block sizes must be multiples of {}", SIZE_INTERVAL);
        return Err(Error::InvalidConfig(msg));
    }

    let nextsize = |from: usize| -> usize {
        let mut addby = (from as f64 * (1.0 - MEM_UTILIZATION)) as usize;
        if addby <= 32 {
            addby = 32;
        }
        let mut size = from + addby;
        while ((from + size) as f64 / 2.0) / (size as f64) > MEM_UTILIZATION {
            size += addby;
        }
        size
    };

    let mut sizes = Vec::with_capacity(MAX_POOLS);
    let mut size = minblock;
    while size < maxblock {
        sizes.push(size);
        size = nextsize(size);
    }
    sizes.push(maxblock);
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sizes() {
        let sizes = block_sizes(32, 64 * 1024).unwrap();
        assert_eq!(sizes[0], 32);
        assert_eq!(*sizes.last().unwrap(), 64 * 1024);
        for win in sizes.windows(2) {
            assert!(win[0] < win[1]);
            // beyond the 32-byte step region, rounding a mid-size request
            // up keeps the average fill near the utilization target
            if win[0] >= 1024 {
                let mid = (win[0] + win[1]) as f64 / 2.0;
                assert!(mid / win[1] as f64 >= MEM_UTILIZATION - 0.05);
            }
        }
        assert!(block_sizes(64, 32).is_err());
        assert!(block_sizes(30, 1024).is_err());
    }

    #[test]
    fn test_suitable_size() {
        let sizes = vec![32, 64, 96, 128];
        assert_eq!(sizes[suitable_size(&sizes, 1)], 32);
        assert_eq!(sizes[suitable_size(&sizes, 32)], 32);
        assert_eq!(sizes[suitable_size(&sizes, 33)], 64);
        assert_eq!(sizes[suitable_size(&sizes, 128)], 128);
    }

    #[test]
    fn test_alloc_free_cycle() {
        let mut arena = Arena::new(32, 1024, 64 * 1024).unwrap();
        assert!(arena.alloc(2048).is_none());

        let mut ptrs = Vec::new();
        for n in [1usize, 31, 32, 33, 100, 1000, 1024] {
            let ptr = arena.alloc(n).unwrap();
            unsafe { ptr.write_bytes(0xcd, n) };
            ptrs.push(ptr);
        }
        assert!(arena.allocated() > 0);
        for ptr in ptrs {
            arena.free(ptr);
        }
        assert_eq!(arena.allocated(), 0);

        // freed blocks are reused
        let first = arena.alloc(100).unwrap();
        arena.free(first);
        let again = arena.alloc(100).unwrap();
        assert_eq!(first as usize, again as usize);
    }

    #[test]
    fn test_pool_overflow_makes_new_pool() {
        // capacity small enough that each pool holds the minimum 8 blocks
        let mut arena = Arena::new(32, 64, 256).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..40 {
            ptrs.push(arena.alloc(32).unwrap());
        }
        // every pointer still maps back to its pool
        for ptr in ptrs {
            arena.free(ptr);
        }
        assert_eq!(arena.allocated(), 0);
    }
}
