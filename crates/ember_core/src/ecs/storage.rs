// storage.rs - per-archetype columnar storage on pool blocks
//
// Each block holds a back-reference array (one EntityId per row) followed
// by one array per present component kind, in ascending kind order. The
// chain is an index-addressed block table rather than links threaded
// through the blocks, so tail removal is O(1) and the full block is
// payload. Every block except the tail is full; fill counts derive from
// the store's logical length.

use bytemuck::Pod;
use std::mem::size_of;
use tracing::trace;

use crate::pool::{BlockIndex, BlockPool, OwnerTag, PoolError, BLOCK_SIZE};

use super::archetype::Archetype;
use super::component::{max_component_size, ComponentKind};
use super::entity::EntityId;

const BACKREF_SIZE: usize = size_of::<EntityId>();

/// Columnar storage for every entity of one archetype.
pub struct ColumnStore {
    archetype: Archetype,
    /// Bytes per logical row: back-reference plus each present component.
    stride: usize,
    /// Rows per block, rounded down to a multiple of 4 so fixed-width
    /// four-wide processing is always safe up to the last partial group.
    capacity: usize,
    len: usize,
    blocks: Vec<BlockIndex>,
}

impl ColumnStore {
    /// Create a store for `archetype`, claiming its first block.
    pub fn new(archetype: Archetype, pool: &mut BlockPool) -> Result<Self, PoolError> {
        debug_assert!(!archetype.is_empty(), "column store needs at least one component");

        let stride = BACKREF_SIZE + archetype.kinds().map(|kind| kind.size()).sum::<usize>();
        let capacity = (BLOCK_SIZE / stride) & !3;
        assert!(
            capacity >= 4,
            "archetype {archetype:?} stride {stride} too large for one block"
        );

        let first = Self::claim_block(pool)?;
        Ok(Self {
            archetype,
            stride,
            capacity,
            len: 0,
            blocks: vec![first],
        })
    }

    #[inline]
    pub fn archetype(&self) -> Archetype {
        self.archetype
    }

    /// Logical number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows per block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block(&self, chain_index: usize) -> BlockIndex {
        self.blocks[chain_index]
    }

    /// Occupied rows of the block at `chain_index`; only the tail may be
    /// partially filled.
    pub fn block_fill(&self, chain_index: usize) -> usize {
        let start = chain_index * self.capacity;
        self.len.saturating_sub(start).min(self.capacity)
    }

    /// Byte offset, within any block, of `kind`'s column: the back-reference
    /// array plus every lower present kind's array.
    pub fn component_offset(&self, kind: ComponentKind) -> usize {
        debug_assert!(
            self.archetype.contains(kind),
            "{:?} has no {kind:?} column",
            self.archetype
        );
        let mut offset = self.capacity * BACKREF_SIZE;
        for present in self.archetype.kinds() {
            if present == kind {
                break;
            }
            offset += self.capacity * present.size();
        }
        offset
    }

    /// Extend the store by `count` rows, filling the tail before claiming
    /// fresh blocks. A failed claim rolls everything back.
    pub fn grow(&mut self, pool: &mut BlockPool, count: usize) -> Result<(), PoolError> {
        let target = self.len + count;
        let needed_blocks = target.div_ceil(self.capacity).max(1);
        let first_new = self.blocks.len();

        while self.blocks.len() < needed_blocks {
            match Self::claim_block(pool) {
                Ok(block) => {
                    trace!(block = block.index(), archetype = ?self.archetype, "column store grew");
                    self.blocks.push(block);
                }
                Err(err) => {
                    for block in self.blocks.drain(first_new..) {
                        pool.free(block);
                    }
                    return Err(err);
                }
            }
        }
        self.len = target;
        Ok(())
    }

    /// Remove the row at `logical_index`, moving the store's last row into
    /// its place to stay dense. Returns the id of the moved entity so the
    /// caller can repoint its record; an emptied tail block is returned to
    /// the pool unless it is the sole block.
    pub fn swap_delete(&mut self, pool: &mut BlockPool, logical_index: usize) -> Option<EntityId> {
        assert!(
            logical_index < self.len,
            "delete of dead row {logical_index} (store length {})",
            self.len
        );

        let last = self.len - 1;
        let mut moved = None;

        if logical_index != last {
            let moved_id = self.backref(pool, last);
            self.set_backref(pool, logical_index, moved_id);

            let mut scratch = [0u8; max_component_size()];
            for kind in self.archetype.kinds() {
                let size = kind.size();
                let offset = self.component_offset(kind);
                let (src_chain, src_start) = self.cell(last, offset, size);
                let (dst_chain, dst_start) = self.cell(logical_index, offset, size);

                if src_chain == dst_chain {
                    let bytes = pool.block_bytes_mut(self.blocks[src_chain]);
                    bytes.copy_within(src_start..src_start + size, dst_start);
                } else {
                    scratch[..size].copy_from_slice(
                        &pool.block_bytes(self.blocks[src_chain])[src_start..src_start + size],
                    );
                    pool.block_bytes_mut(self.blocks[dst_chain])[dst_start..dst_start + size]
                        .copy_from_slice(&scratch[..size]);
                }
            }
            moved = Some(moved_id);
        }

        self.len -= 1;
        if self.blocks.len() > 1 && self.block_fill(self.blocks.len() - 1) == 0 {
            let tail = self.blocks.pop().expect("chain is never empty");
            pool.free(tail);
            trace!(block = tail.index(), archetype = ?self.archetype, "column store shrank");
        }
        moved
    }

    /// Back-reference of the row at `logical_index`.
    pub fn backref(&self, pool: &BlockPool, logical_index: usize) -> EntityId {
        debug_assert!(logical_index < self.len);
        let (chain, start) = self.cell(logical_index, 0, BACKREF_SIZE);
        bytemuck::pod_read_unaligned(
            &pool.block_bytes(self.blocks[chain])[start..start + BACKREF_SIZE],
        )
    }

    pub fn set_backref(&self, pool: &mut BlockPool, logical_index: usize, id: EntityId) {
        debug_assert!(logical_index < self.len);
        let (chain, start) = self.cell(logical_index, 0, BACKREF_SIZE);
        pool.block_bytes_mut(self.blocks[chain])[start..start + BACKREF_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&id));
    }

    /// Typed borrow of one row's component value.
    pub fn cell_ref<'p, T: Pod>(
        &self,
        pool: &'p BlockPool,
        logical_index: usize,
        kind: ComponentKind,
    ) -> &'p T {
        debug_assert_eq!(size_of::<T>(), kind.size(), "payload type mismatch for {kind:?}");
        debug_assert!(logical_index < self.len);
        let (chain, start) = self.cell(logical_index, self.component_offset(kind), kind.size());
        bytemuck::from_bytes(&pool.block_bytes(self.blocks[chain])[start..start + size_of::<T>()])
    }

    /// Typed mutable borrow of one row's component value.
    pub fn cell_mut<'p, T: Pod>(
        &self,
        pool: &'p mut BlockPool,
        logical_index: usize,
        kind: ComponentKind,
    ) -> &'p mut T {
        debug_assert_eq!(size_of::<T>(), kind.size(), "payload type mismatch for {kind:?}");
        debug_assert!(logical_index < self.len);
        let (chain, start) = self.cell(logical_index, self.component_offset(kind), kind.size());
        bytemuck::from_bytes_mut(
            &mut pool.block_bytes_mut(self.blocks[chain])[start..start + size_of::<T>()],
        )
    }

    /// Return every block to the pool. The store is unusable afterwards.
    pub fn teardown(&mut self, pool: &mut BlockPool) {
        for block in self.blocks.drain(..) {
            pool.free(block);
        }
        self.len = 0;
    }

    /// `(byte offset, element size)` per requested kind; `kinds` must be in
    /// ascending kind order so the offsets ascend.
    pub(crate) fn column_ranges(&self, kinds: &[ComponentKind]) -> Vec<(usize, usize)> {
        debug_assert!(kinds.windows(2).all(|pair| pair[0].index() < pair[1].index()));
        kinds
            .iter()
            .map(|&kind| (self.component_offset(kind), kind.size()))
            .collect()
    }

    fn claim_block(pool: &mut BlockPool) -> Result<BlockIndex, PoolError> {
        let block = pool.alloc_blocks(1, OwnerTag::Entity)?;
        pool.block_bytes_mut(block).fill(0);
        Ok(block)
    }

    /// `(chain index, byte offset within block)` of one cell.
    fn cell(&self, logical_index: usize, column_offset: usize, size: usize) -> (usize, usize) {
        let chain = logical_index / self.capacity;
        let slot = logical_index % self.capacity;
        (chain, column_offset + slot * size)
    }
}

/// One block's worth of requested columns, positioned at a row range.
///
/// Handed to iteration and creation callbacks. The back-reference column
/// is exposed through [`entities`](Self::entities); requested component
/// columns are addressed by kind and cast on demand, with each column's
/// element size available for generic consumers.
pub struct ColumnView<'a, 'k> {
    count: usize,
    archetype: Archetype,
    entities: &'a mut [EntityId],
    kinds: &'k [ComponentKind],
    sizes: &'k [usize],
    columns: Vec<&'a mut [u8]>,
}

impl<'a, 'k> ColumnView<'a, 'k> {
    /// Carve disjoint column windows out of one block's bytes.
    ///
    /// `start` and `count` select the row range; `ranges` pairs each
    /// requested kind with its `(offset, element size)` in ascending
    /// offset order.
    pub(crate) fn split(
        bytes: &'a mut [u8],
        archetype: Archetype,
        start: usize,
        count: usize,
        kinds: &'k [ComponentKind],
        sizes: &'k [usize],
        ranges: &[(usize, usize)],
    ) -> Self {
        let mut windows = Vec::with_capacity(ranges.len() + 1);
        let mut rest = bytes;
        let mut consumed = 0;

        for &(offset, size) in std::iter::once(&(0, BACKREF_SIZE)).chain(ranges.iter()) {
            let window_start = offset + start * size;
            let window_len = count * size;
            let remainder = std::mem::take(&mut rest);
            let (_, after_skip) = remainder.split_at_mut(window_start - consumed);
            let (window, after) = after_skip.split_at_mut(window_len);
            windows.push(window);
            consumed = window_start + window_len;
            rest = after;
        }

        let mut windows = windows.into_iter();
        let entities =
            bytemuck::cast_slice_mut(windows.next().expect("back-reference window exists"));
        Self {
            count,
            archetype,
            entities,
            kinds,
            sizes,
            columns: windows.collect(),
        }
    }

    /// Rows in this range.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn archetype(&self) -> Archetype {
        self.archetype
    }

    /// Back-references: the owning entity of each row.
    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        self.entities
    }

    #[inline]
    pub(crate) fn entities_mut(&mut self) -> &mut [EntityId] {
        self.entities
    }

    /// Requested kinds, ascending; parallel to the column addresses.
    #[inline]
    pub fn kinds(&self) -> &[ComponentKind] {
        self.kinds
    }

    /// Element size of each requested column, for generic consumers.
    #[inline]
    pub fn column_sizes(&self) -> &[usize] {
        self.sizes
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Typed view of `kind`'s column over this range.
    pub fn column<T: Pod>(&self, kind: ComponentKind) -> &[T] {
        let position = self.position(kind);
        debug_assert_eq!(size_of::<T>(), self.sizes[position]);
        bytemuck::cast_slice(&self.columns[position][..])
    }

    /// Typed mutable view of `kind`'s column over this range.
    pub fn column_mut<T: Pod>(&mut self, kind: ComponentKind) -> &mut [T] {
        let position = self.position(kind);
        debug_assert_eq!(size_of::<T>(), self.sizes[position]);
        bytemuck::cast_slice_mut(&mut self.columns[position][..])
    }

    /// Two distinct columns borrowed mutably at once.
    pub fn column_pair_mut<A: Pod, B: Pod>(
        &mut self,
        first: ComponentKind,
        second: ComponentKind,
    ) -> (&mut [A], &mut [B]) {
        let a = self.position(first);
        let b = self.position(second);
        assert_ne!(a, b, "requested the same column twice");
        debug_assert_eq!(size_of::<A>(), self.sizes[a]);
        debug_assert_eq!(size_of::<B>(), self.sizes[b]);

        if a < b {
            let (low, high) = self.columns.split_at_mut(b);
            (
                bytemuck::cast_slice_mut(&mut low[a][..]),
                bytemuck::cast_slice_mut(&mut high[0][..]),
            )
        } else {
            let (low, high) = self.columns.split_at_mut(a);
            (
                bytemuck::cast_slice_mut(&mut high[0][..]),
                bytemuck::cast_slice_mut(&mut low[b][..]),
            )
        }
    }

    /// Raw bytes of the column at `position`, for generic consumers.
    pub fn column_bytes(&self, position: usize) -> &[u8] {
        &self.columns[position][..]
    }

    fn position(&self, kind: ComponentKind) -> usize {
        self.kinds
            .iter()
            .position(|&requested| requested == kind)
            .unwrap_or_else(|| panic!("column for {kind:?} was not requested"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::ComponentKind::*;
    use glam::Vec3;

    fn pool() -> BlockPool {
        BlockPool::new(16)
    }

    #[test]
    fn test_layout_for_position_velocity() {
        let mut pool = pool();
        let store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();

        // stride 4 + 12 + 12 = 28; 1024 / 28 = 36, already a multiple of 4.
        assert_eq!(store.stride(), 28);
        assert_eq!(store.capacity(), 36);
        assert_eq!(store.component_offset(Position), 36 * 4);
        assert_eq!(store.component_offset(Velocity), 36 * 4 + 36 * 12);
        assert_eq!(store.num_blocks(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_capacity_rounds_down_to_multiple_of_four() {
        let mut pool = pool();
        // stride 4 + 12 + 6 = 22; 1024 / 22 = 46 -> 44.
        let store = ColumnStore::new(Position | Rotation, &mut pool).unwrap();
        assert_eq!(store.capacity(), 44);
    }

    #[test]
    fn test_grow_across_capacity_boundaries() {
        let mut pool = pool();
        let mut store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();
        let capacity = store.capacity();

        store.grow(&mut pool, capacity).unwrap();
        assert_eq!(store.num_blocks(), 1);
        assert_eq!(store.block_fill(0), capacity);

        store.grow(&mut pool, 1).unwrap();
        assert_eq!(store.num_blocks(), 2);
        assert_eq!(store.block_fill(1), 1);

        store.grow(&mut pool, capacity - 2).unwrap();
        assert_eq!(store.num_blocks(), 2);
        assert_eq!(store.block_fill(1), capacity - 1);
        assert_eq!(store.len(), 2 * capacity - 1);
    }

    #[test]
    fn test_failed_grow_rolls_back() {
        let mut tiny = BlockPool::new(2);
        let mut store = ColumnStore::new(Position | Velocity, &mut tiny).unwrap();
        let capacity = store.capacity();

        // One spare block in the pool; asking for three blocks' worth fails.
        let err = store.grow(&mut tiny, 3 * capacity).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(store.len(), 0);
        assert_eq!(store.num_blocks(), 1);
        assert_eq!(tiny.free_blocks(), 1);
    }

    #[test]
    fn test_swap_delete_moves_last_row() {
        let mut pool = pool();
        let mut store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();
        store.grow(&mut pool, 4).unwrap();

        for row in 0..4 {
            store.set_backref(&mut pool, row, EntityId::new(100 + row as u32));
            *store.cell_mut::<Vec3>(&mut pool, row, Position) = Vec3::splat(row as f32);
            *store.cell_mut::<Vec3>(&mut pool, row, Velocity) = Vec3::splat(row as f32 * 10.0);
        }

        let moved = store.swap_delete(&mut pool, 1);
        assert_eq!(moved, Some(EntityId::new(103)));
        assert_eq!(store.len(), 3);

        // Row 3's values now live at row 1, back-reference included.
        assert_eq!(store.backref(&pool, 1), EntityId::new(103));
        assert_eq!(*store.cell_ref::<Vec3>(&pool, 1, Position), Vec3::splat(3.0));
        assert_eq!(*store.cell_ref::<Vec3>(&pool, 1, Velocity), Vec3::splat(30.0));

        // Deleting the last row moves nothing.
        assert_eq!(store.swap_delete(&mut pool, 2), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_emptied_tail_returns_to_pool() {
        let mut pool = pool();
        let mut store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();
        let capacity = store.capacity();

        store.grow(&mut pool, capacity + 1).unwrap();
        for row in 0..capacity + 1 {
            store.set_backref(&mut pool, row, EntityId::new(row as u32));
        }
        assert_eq!(store.num_blocks(), 2);
        let in_use = pool.blocks_in_use();

        store.swap_delete(&mut pool, capacity);
        assert_eq!(store.num_blocks(), 1);
        assert_eq!(pool.blocks_in_use(), in_use - 1);

        // The sole block is never released, even once empty.
        for _ in 0..capacity {
            store.swap_delete(&mut pool, 0);
        }
        assert_eq!(store.len(), 0);
        assert_eq!(store.num_blocks(), 1);
    }

    #[test]
    fn test_swap_delete_copies_across_blocks() {
        let mut pool = pool();
        let mut store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();
        let capacity = store.capacity();

        store.grow(&mut pool, capacity + 2).unwrap();
        for row in 0..capacity + 2 {
            store.set_backref(&mut pool, row, EntityId::new(row as u32));
            *store.cell_mut::<Vec3>(&mut pool, row, Position) = Vec3::splat(row as f32);
        }

        // Last row lives in block 1; the vacated slot is in block 0.
        let last = capacity + 1;
        let moved = store.swap_delete(&mut pool, 3);
        assert_eq!(moved, Some(EntityId::new(last as u32)));
        assert_eq!(
            *store.cell_ref::<Vec3>(&pool, 3, Position),
            Vec3::splat(last as f32)
        );
    }

    #[test]
    fn test_claimed_blocks_are_zeroed() {
        let mut pool = pool();
        // Dirty a block, free it, then claim it through a store.
        let scratch = pool.alloc_blocks(1, OwnerTag::Heap).unwrap();
        pool.block_bytes_mut(scratch).fill(0xFF);
        pool.free(scratch);

        let mut store = ColumnStore::new(Position.into(), &mut pool).unwrap();
        store.grow(&mut pool, 4).unwrap();
        assert_eq!(*store.cell_ref::<Vec3>(&pool, 0, Position), Vec3::ZERO);
        assert_eq!(store.backref(&pool, 3), EntityId::new(0));
    }

    #[test]
    fn test_teardown_returns_every_block() {
        let mut pool = pool();
        let free_before = pool.free_blocks();
        let mut store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();
        store.grow(&mut pool, store.capacity() * 3).unwrap();
        assert_eq!(pool.free_blocks(), free_before - 3);

        store.teardown(&mut pool);
        assert_eq!(pool.free_blocks(), free_before);
    }

    #[test]
    fn test_column_view_split_and_cast() {
        let mut pool = pool();
        let mut store = ColumnStore::new(Position | Velocity, &mut pool).unwrap();
        store.grow(&mut pool, 8).unwrap();

        let kinds = [Position, Velocity];
        let sizes = [Position.size(), Velocity.size()];
        let ranges = store.column_ranges(&kinds);
        let archetype = store.archetype();

        let bytes = pool.block_bytes_mut(store.block(0));
        let mut view = ColumnView::split(bytes, archetype, 2, 4, &kinds, &sizes, &ranges);

        assert_eq!(view.count(), 4);
        assert_eq!(view.num_columns(), 2);
        assert_eq!(view.column_sizes(), &[12, 12]);

        let (positions, velocities) = view.column_pair_mut::<Vec3, Vec3>(Position, Velocity);
        positions[0] = Vec3::new(1.0, 2.0, 3.0);
        velocities[3] = Vec3::new(4.0, 5.0, 6.0);

        // The range started at row 2, so row 2 and row 5 took the writes.
        assert_eq!(*store.cell_ref::<Vec3>(&pool, 2, Position), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(*store.cell_ref::<Vec3>(&pool, 5, Velocity), Vec3::new(4.0, 5.0, 6.0));
    }
}
