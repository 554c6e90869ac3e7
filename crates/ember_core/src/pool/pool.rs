// pool.rs - fixed-region block pool with intrusive free list
//
// The region never grows. Free blocks double as nodes of a doubly-linked
// free list threaded through their own storage, so bookkeeping costs one
// ownership byte per block and nothing else. List order and address order
// are independent: multi-block allocation walks the list but checks
// contiguity through the ownership table.

use bytemuck::{Pod, Zeroable};
use ember_metrics::{Counter, HighWater};
use thiserror::Error;
use tracing::{info, trace, warn};

use super::OwnerTag;

/// Size of one pool block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Sentinel for "no block" in free-list links.
const NIL: u32 = u32::MAX;

/// Index of a block within the pool region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockIndex(u32);

impl BlockIndex {
    fn new(index: u32) -> Self {
        Self(index)
    }

    /// Position of the block within the region.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool exhausted: no run of {requested} contiguous free blocks")]
    Exhausted { requested: usize },
}

/// Free-list node stored in the first bytes of an unallocated block.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct FreeLink {
    prev: u32,
    next: u32,
}

/// Fixed-capacity pool of `BLOCK_SIZE`-byte blocks.
///
/// Single-allocation and single-free are O(1); allocating a contiguous run
/// of `n` blocks is O(free blocks * n) worst case. Freeing the first block
/// of a run releases the entire run.
///
/// # Thread Safety
///
/// Not thread-safe; the pool has a single logical owner. A multi-threaded
/// embedding must serialize access externally.
pub struct BlockPool {
    /// Backing region. `u64` storage keeps every block 8-byte aligned,
    /// which covers the alignment of every component payload.
    region: Box<[u64]>,
    /// Ownership table, one tag per block.
    owners: Box<[OwnerTag]>,
    total_blocks: usize,
    /// Head of the intrusive free list, or `NIL` when exhausted.
    first_free: u32,
    counters: Counter,
    occupancy: HighWater,
}

impl BlockPool {
    /// Create a pool backed by `total_blocks` blocks of `BLOCK_SIZE` bytes.
    ///
    /// The whole region is allocated up front; all blocks start free and
    /// linked into one free list in address order.
    pub fn new(total_blocks: usize) -> Self {
        assert!(
            total_blocks > 0 && total_blocks < NIL as usize,
            "invalid pool size: {total_blocks} blocks"
        );

        let region = vec![0u64; total_blocks * (BLOCK_SIZE / 8)].into_boxed_slice();
        let owners = vec![OwnerTag::Free; total_blocks].into_boxed_slice();
        let mut pool = Self {
            region,
            owners,
            total_blocks,
            first_free: 0,
            counters: Counter::new(),
            occupancy: HighWater::new(),
        };

        for index in 0..total_blocks as u32 {
            let prev = if index == 0 { NIL } else { index - 1 };
            let next = if index as usize + 1 == total_blocks {
                NIL
            } else {
                index + 1
            };
            pool.set_link(index, FreeLink { prev, next });
        }

        info!(total_blocks, block_size = BLOCK_SIZE, "block pool initialized");
        pool
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Number of free blocks according to the ownership table.
    pub fn free_blocks(&self) -> usize {
        self.owners
            .iter()
            .filter(|&&tag| tag == OwnerTag::Free)
            .count()
    }

    /// Number of blocks reachable from the free-list head.
    ///
    /// Always equal to [`free_blocks`](Self::free_blocks) unless the list
    /// has been corrupted; kept separate so the invariant is checkable.
    pub fn free_list_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.first_free;
        while cursor != NIL {
            count += 1;
            assert!(count <= self.total_blocks, "free list cycle detected");
            cursor = self.link(cursor).next;
        }
        count
    }

    #[inline]
    pub fn blocks_in_use(&self) -> usize {
        self.total_blocks - self.free_blocks()
    }

    /// Current owner of a block.
    pub fn owner_of(&self, block: BlockIndex) -> OwnerTag {
        self.owners[block.index()]
    }

    /// Allocate `n_blocks` contiguous blocks tagged with `owner`.
    ///
    /// A single block pops the free-list head in O(1). A run walks the
    /// free list and, for each candidate, checks that the following
    /// `n_blocks - 1` blocks by address are in bounds and free. On failure
    /// nothing is allocated.
    ///
    /// # Panics
    ///
    /// Requesting zero blocks is a caller error and asserts.
    pub fn alloc_blocks(
        &mut self,
        n_blocks: usize,
        owner: OwnerTag,
    ) -> Result<BlockIndex, PoolError> {
        assert!(
            n_blocks > 0,
            "attempted to allocate zero blocks (owner {owner:?})"
        );
        debug_assert!(
            owner.is_claimable(),
            "blocks cannot be claimed as {owner:?}"
        );

        if n_blocks == 1 {
            let head = self.first_free;
            if head == NIL {
                return Err(PoolError::Exhausted { requested: 1 });
            }
            debug_assert_eq!(
                self.owners[head as usize],
                OwnerTag::Free,
                "free list head already claimed"
            );
            self.unlink(head);
            self.owners[head as usize] = owner;
            self.note_alloc(1);
            trace!(block = head, ?owner, "allocated block");
            return Ok(BlockIndex::new(head));
        }

        let mut cursor = self.first_free;
        while cursor != NIL {
            let start = cursor as usize;
            if self.run_is_free(start, n_blocks) {
                for offset in 0..n_blocks {
                    self.unlink((start + offset) as u32);
                    self.owners[start + offset] = if offset == 0 {
                        owner
                    } else {
                        OwnerTag::Continuation
                    };
                }
                self.note_alloc(n_blocks);
                trace!(first = start, count = n_blocks, ?owner, "allocated run");
                return Ok(BlockIndex::new(start as u32));
            }
            cursor = self.link(cursor).next;
        }
        Err(PoolError::Exhausted {
            requested: n_blocks,
        })
    }

    /// Allocate a contiguous region at least `len` bytes long.
    pub fn alloc_region(&mut self, len: usize, owner: OwnerTag) -> Result<BlockIndex, PoolError> {
        // Rounded-up division; a zero-length request still asserts.
        self.alloc_blocks(len.div_ceil(BLOCK_SIZE), owner)
    }

    /// Free an allocation starting at `block`.
    ///
    /// Every following block tagged `Continuation` is released with it, so
    /// one call returns an entire multi-block run. Freeing an already-free
    /// block is a diagnosed no-op; the free list is never corrupted by it.
    pub fn free(&mut self, block: BlockIndex) {
        let mut index = block.index();
        assert!(
            index < self.total_blocks,
            "freed block {index} out of range ({} blocks)",
            self.total_blocks
        );

        if self.owners[index] == OwnerTag::Free {
            warn!(block = index, "double free ignored");
            self.counters.add("double_frees", 1);
            return;
        }

        let mut released = 0;
        loop {
            self.owners[index] = OwnerTag::Free;
            self.push_front(index as u32);
            released += 1;
            index += 1;
            if index >= self.total_blocks || self.owners[index] != OwnerTag::Continuation {
                break;
            }
        }
        self.note_free(released);
        trace!(first = block.index(), count = released, "released blocks");
    }

    /// Borrow a block's bytes.
    pub fn block_bytes(&self, block: BlockIndex) -> &[u8] {
        let start = block.index() * BLOCK_SIZE;
        &self.bytes()[start..start + BLOCK_SIZE]
    }

    /// Borrow a block's bytes mutably.
    pub fn block_bytes_mut(&mut self, block: BlockIndex) -> &mut [u8] {
        let start = block.index() * BLOCK_SIZE;
        &mut self.bytes_mut()[start..start + BLOCK_SIZE]
    }

    pub fn counters(&self) -> &Counter {
        &self.counters
    }

    pub fn occupancy(&self) -> &HighWater {
        &self.occupancy
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.region)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.region)
    }

    fn link(&self, index: u32) -> FreeLink {
        let start = index as usize * BLOCK_SIZE;
        bytemuck::pod_read_unaligned(&self.bytes()[start..start + size_of_link()])
    }

    fn set_link(&mut self, index: u32, link: FreeLink) {
        let start = index as usize * BLOCK_SIZE;
        self.bytes_mut()[start..start + size_of_link()].copy_from_slice(bytemuck::bytes_of(&link));
    }

    /// Remove a block from the free list, stitching its neighbors together.
    fn unlink(&mut self, index: u32) {
        let link = self.link(index);
        if link.prev == NIL {
            self.first_free = link.next;
        } else {
            let mut prev = self.link(link.prev);
            prev.next = link.next;
            self.set_link(link.prev, prev);
        }
        if link.next != NIL {
            let mut next = self.link(link.next);
            next.prev = link.prev;
            self.set_link(link.next, next);
        }
    }

    /// Insert a block at the free-list head.
    fn push_front(&mut self, index: u32) {
        let head = self.first_free;
        self.set_link(index, FreeLink { prev: NIL, next: head });
        if head != NIL {
            let mut old = self.link(head);
            old.prev = index;
            self.set_link(head, old);
        }
        self.first_free = index;
    }

    /// Whether `n_blocks` starting at `start` are in bounds and all free.
    ///
    /// `start` itself comes off the free list; only the trailing blocks
    /// need the address check.
    fn run_is_free(&self, start: usize, n_blocks: usize) -> bool {
        debug_assert_eq!(self.owners[start], OwnerTag::Free);
        if start + n_blocks > self.total_blocks {
            return false;
        }
        self.owners[start + 1..start + n_blocks]
            .iter()
            .all(|&tag| tag == OwnerTag::Free)
    }

    fn note_alloc(&mut self, n_blocks: usize) {
        self.counters.add("blocks_allocated", n_blocks as u64);
        self.occupancy.raise(n_blocks);
    }

    fn note_free(&mut self, n_blocks: usize) {
        self.counters.add("blocks_freed", n_blocks as u64);
        self.occupancy.lower(n_blocks);
    }
}

const fn size_of_link() -> usize {
    std::mem::size_of::<FreeLink>()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tag count and list walk must always agree (§ accounting below holds
    /// for every test exit state as well).
    fn assert_consistent(pool: &BlockPool) {
        assert_eq!(pool.free_blocks(), pool.free_list_len());
    }

    #[test]
    fn test_new_pool_is_fully_free() {
        let pool = BlockPool::new(16);
        assert_eq!(pool.total_blocks(), 16);
        assert_eq!(pool.free_blocks(), 16);
        assert_eq!(pool.free_list_len(), 16);
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn test_single_alloc_free_roundtrip() {
        let mut pool = BlockPool::new(4);

        let block = pool.alloc_blocks(1, OwnerTag::Entity).unwrap();
        assert_eq!(pool.owner_of(block), OwnerTag::Entity);
        assert_eq!(pool.free_blocks(), 3);
        assert_consistent(&pool);

        pool.free(block);
        assert_eq!(pool.owner_of(block), OwnerTag::Free);
        assert_eq!(pool.free_blocks(), 4);
        assert_consistent(&pool);
    }

    #[test]
    #[should_panic(expected = "zero blocks")]
    fn test_zero_block_alloc_asserts() {
        let mut pool = BlockPool::new(4);
        let _ = pool.alloc_blocks(0, OwnerTag::Gfx);
    }

    #[test]
    fn test_contiguous_run_tagging() {
        let mut pool = BlockPool::new(8);

        // Address-ordered init means the first single allocation is block 0
        // and the run search starts at block 1.
        let single = pool.alloc_blocks(1, OwnerTag::Gfx).unwrap();
        assert_eq!(single.index(), 0);

        let run = pool.alloc_blocks(3, OwnerTag::Audio).unwrap();
        assert_eq!(run.index(), 1);
        assert_eq!(pool.owner_of(run), OwnerTag::Audio);
        for offset in 1..3 {
            let trailing = pool.alloc_blocks(1, OwnerTag::File).map(|b| b.index());
            // Blocks 2 and 3 must be claimed, so singles skip past them.
            assert_ne!(trailing, Ok(run.index() + offset));
        }
        assert_consistent(&pool);
    }

    #[test]
    fn test_free_one_frees_whole_run() {
        let mut pool = BlockPool::new(8);
        let run = pool.alloc_blocks(5, OwnerTag::File).unwrap();
        assert_eq!(pool.free_blocks(), 3);

        pool.free(run);
        assert_eq!(pool.free_blocks(), 8);
        assert_consistent(&pool);

        // All five blocks are individually re-obtainable.
        for _ in 0..8 {
            pool.alloc_blocks(1, OwnerTag::Heap).unwrap();
        }
        assert!(pool.alloc_blocks(1, OwnerTag::Heap).is_err());
    }

    #[test]
    fn test_run_search_checks_addresses_not_list_order() {
        let mut pool = BlockPool::new(6);
        let blocks: Vec<_> = (0..4)
            .map(|_| pool.alloc_blocks(1, OwnerTag::Entity).unwrap())
            .collect();

        // Free in shuffled order so the list order disagrees with address
        // order: list head chain becomes 2 -> 3 -> 1 -> 4 -> 5.
        pool.free(blocks[1]);
        pool.free(blocks[3]);
        pool.free(blocks[2]);

        let run = pool.alloc_blocks(3, OwnerTag::Gfx).unwrap();
        assert_eq!(run.index(), 2, "first fit must find blocks 2..5");
        assert_eq!(pool.owner_of(run), OwnerTag::Gfx);
        assert_consistent(&pool);
    }

    #[test]
    fn test_exhaustion_returns_error_without_partial_allocation() {
        let mut pool = BlockPool::new(4);
        let err = pool.alloc_blocks(5, OwnerTag::Audio).unwrap_err();
        assert_eq!(err, PoolError::Exhausted { requested: 5 });
        // A failed run allocation must not consume anything.
        assert_eq!(pool.free_blocks(), 4);
        assert_consistent(&pool);

        for _ in 0..4 {
            pool.alloc_blocks(1, OwnerTag::Audio).unwrap();
        }
        assert_eq!(
            pool.alloc_blocks(1, OwnerTag::Audio),
            Err(PoolError::Exhausted { requested: 1 })
        );
    }

    #[test]
    fn test_double_free_is_diagnosed_noop() {
        let mut pool = BlockPool::new(4);
        let block = pool.alloc_blocks(1, OwnerTag::Entity).unwrap();
        pool.free(block);
        let free_before = pool.free_blocks();

        pool.free(block);
        assert_eq!(pool.free_blocks(), free_before);
        assert_consistent(&pool);
        #[cfg(feature = "metrics")]
        assert_eq!(pool.counters().get("double_frees"), 1);
    }

    #[test]
    fn test_alloc_region_rounds_up() {
        let mut pool = BlockPool::new(4);
        let region = pool.alloc_region(BLOCK_SIZE + 500, OwnerTag::HeapArray).unwrap();
        assert_eq!(pool.blocks_in_use(), 2);
        assert_eq!(pool.owner_of(region), OwnerTag::HeapArray);

        pool.free(region);
        assert_eq!(pool.free_blocks(), 4);
    }

    #[test]
    fn test_block_bytes_are_isolated() {
        let mut pool = BlockPool::new(3);
        let a = pool.alloc_blocks(1, OwnerTag::Entity).unwrap();
        let b = pool.alloc_blocks(1, OwnerTag::Entity).unwrap();

        pool.block_bytes_mut(a).fill(0xAB);
        pool.block_bytes_mut(b).fill(0xCD);
        assert!(pool.block_bytes(a).iter().all(|&byte| byte == 0xAB));
        assert!(pool.block_bytes(b).iter().all(|&byte| byte == 0xCD));
    }

    #[test]
    fn test_accounting_after_mixed_traffic() {
        let mut pool = BlockPool::new(12);
        let a = pool.alloc_blocks(2, OwnerTag::Gfx).unwrap();
        let b = pool.alloc_blocks(1, OwnerTag::Audio).unwrap();
        let c = pool.alloc_blocks(4, OwnerTag::Entity).unwrap();
        pool.free(b);
        let d = pool.alloc_blocks(3, OwnerTag::File).unwrap();

        assert_eq!(pool.blocks_in_use(), 2 + 4 + 3);
        assert_consistent(&pool);

        pool.free(a);
        pool.free(c);
        pool.free(d);
        assert_eq!(pool.free_blocks(), 12);
        assert_consistent(&pool);

        #[cfg(feature = "metrics")]
        {
            assert_eq!(pool.counters().get("blocks_allocated"), 10);
            assert_eq!(pool.counters().get("blocks_freed"), 10);
            assert_eq!(pool.occupancy().peak(), 9);
            assert_eq!(pool.occupancy().current(), 0);
        }
    }
}
