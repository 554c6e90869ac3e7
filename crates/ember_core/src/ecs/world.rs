// world.rs - the owning context: registry, entity lifecycle, iteration
//
// All ECS state lives here: the block pool, the archetype registry and
// its column stores, the global entity table, and the deferred mutation
// queues. There are no process-wide globals; every entry point threads
// through this one object.

use bytemuck::Pod;
use ember_metrics::Counter;
use thiserror::Error;
use tracing::{debug, info};

use crate::pool::{BlockPool, PoolError};

use super::archetype::Archetype;
use super::component::{
    ActiveState, BehaviorKind, BehaviorState, ComponentKind, PulseParams, Rot3,
    SelfDestructParams, SpinParams,
};
use super::entity::{EntityId, EntityTable, MAX_ENTITIES};
use super::queue::EntityQueues;
use super::storage::{ColumnStore, ColumnView};

/// Upper bound on simultaneously registered archetypes.
pub const MAX_ARCHETYPES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EcsError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("entity table full ({max} slots)")]
    EntityTableFull { max: usize },
    #[error("archetype limit reached ({max})")]
    ArchetypeLimit { max: usize },
}

type Callback<'f, 'c> = &'f mut (dyn FnMut(&mut EntityQueues, &mut ColumnView<'_, '_>) + 'c);

/// The entity world: block pool, archetype stores, entity table, queues.
///
/// Single-threaded by construction; iteration callbacks receive the
/// [`EntityQueues`] handle as their only legal path to structural
/// mutation while a pass is in flight.
pub struct World {
    pool: BlockPool,
    stores: Vec<ColumnStore>,
    entities: EntityTable,
    queues: EntityQueues,
    in_iteration: bool,
    counters: Counter,
}

impl World {
    /// Create a world backed by a fresh pool of `pool_blocks` blocks.
    pub fn new(pool_blocks: usize) -> Self {
        Self::with_pool(BlockPool::new(pool_blocks))
    }

    /// Create a world sharing an existing pool (the usual arrangement:
    /// graphics, audio, and file loading claim blocks from the same pool).
    pub fn with_pool(pool: BlockPool) -> Self {
        info!("entity world initialized");
        Self {
            pool,
            stores: Vec::new(),
            entities: EntityTable::new(),
            queues: EntityQueues::new(),
            in_iteration: false,
            counters: Counter::new(),
        }
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BlockPool {
        &mut self.pool
    }

    pub fn counters(&self) -> &Counter {
        &self.counters
    }

    /// Number of live entities.
    pub fn live_entities(&self) -> usize {
        self.entities.live()
    }

    /// Number of registered archetypes.
    pub fn registered_archetypes(&self) -> usize {
        self.stores.len()
    }

    /// Register `archetype` ahead of first use. Registration is otherwise
    /// lazy: creating an entity registers its archetype on demand.
    pub fn register_archetype(&mut self, archetype: Archetype) -> Result<(), EcsError> {
        self.store_index(archetype).map(|_| ())
    }

    /// Create one entity. Batch creation is cheaper per entity.
    pub fn create_entity(&mut self, archetype: Archetype) -> Result<EntityId, EcsError> {
        let ids = self.create_internal(archetype, 1, None)?;
        Ok(ids[0])
    }

    /// Create `count` entities with zero-initialized components.
    pub fn create_entities(&mut self, archetype: Archetype, count: usize) -> Result<(), EcsError> {
        self.create_internal(archetype, count, None).map(|_| ())
    }

    /// Create `count` entities, invoking `callback` once per contiguous
    /// range actually modified: once for the filled portion of the
    /// pre-existing tail block (if any), then once per freshly claimed
    /// block. The view is positioned at the start of each range so
    /// initializers can write straight through without per-entity dispatch.
    pub fn create_entities_with<F>(
        &mut self,
        archetype: Archetype,
        count: usize,
        mut callback: F,
    ) -> Result<(), EcsError>
    where
        F: FnMut(&mut EntityQueues, &mut ColumnView<'_, '_>),
    {
        self.create_internal(archetype, count, Some(&mut callback))
            .map(|_| ())
    }

    /// Delete a live entity: swap-delete its row, repoint the moved
    /// entity's record, and clear the slot.
    ///
    /// # Panics
    ///
    /// Deleting a slot that is not currently live asserts; continuing
    /// would corrupt the store.
    pub fn delete_entity(&mut self, id: EntityId) {
        assert!(
            self.entities.is_live(id),
            "delete of dead entity slot {}",
            id.slot()
        );
        let record = self.entities.record(id);
        let store_index = self
            .stores
            .iter()
            .position(|store| store.archetype() == record.archetype)
            .expect("live entity references an unregistered archetype");

        if let Some(moved) = self.stores[store_index].swap_delete(&mut self.pool, record.index as usize)
        {
            self.entities.set_index(moved, record.index);
        }
        self.entities.free(id);
        self.counters.add("entities_deleted", 1);
    }

    /// Typed borrow of one component of a live entity.
    pub fn component<T: Pod>(&self, id: EntityId, kind: ComponentKind) -> Option<&T> {
        if !self.entities.is_live(id) {
            return None;
        }
        let record = self.entities.record(id);
        if !record.archetype.contains(kind) {
            return None;
        }
        let store = self
            .stores
            .iter()
            .find(|store| store.archetype() == record.archetype)?;
        Some(store.cell_ref(&self.pool, record.index as usize, kind))
    }

    /// Typed mutable borrow of one component of a live entity.
    pub fn component_mut<T: Pod>(&mut self, id: EntityId, kind: ComponentKind) -> Option<&mut T> {
        if !self.entities.is_live(id) {
            return None;
        }
        let record = self.entities.record(id);
        if !record.archetype.contains(kind) {
            return None;
        }
        let store = self
            .stores
            .iter()
            .find(|store| store.archetype() == record.archetype)?;
        Some(store.cell_mut(&mut self.pool, record.index as usize, kind))
    }

    /// Find the entity occupying `(archetype, logical_index)`, if any.
    pub fn find_entity(&self, archetype: Archetype, logical_index: u32) -> Option<EntityId> {
        self.entities.find(archetype, logical_index)
    }

    /// Walk every block of every archetype that has all of `required` and
    /// none of `excluded`, invoking `callback` per block with the
    /// requested columns. Structural mutation from inside the callback
    /// must go through the provided [`EntityQueues`]; queued work is
    /// applied after the walk, creations draining to a fixed point.
    pub fn iterate<F>(
        &mut self,
        required: Archetype,
        excluded: Archetype,
        mut callback: F,
    ) -> Result<(), EcsError>
    where
        F: FnMut(&mut EntityQueues, &mut ColumnView<'_, '_>),
    {
        self.iterate_inner(required, excluded, false, &mut callback)
    }

    /// Like [`iterate`](Self::iterate), but the view carries every column
    /// the archetype has (plus element sizes), so a generic consumer can
    /// process archetypes it does not know ahead of time.
    pub fn iterate_all<F>(
        &mut self,
        required: Archetype,
        excluded: Archetype,
        mut callback: F,
    ) -> Result<(), EcsError>
    where
        F: FnMut(&mut EntityQueues, &mut ColumnView<'_, '_>),
    {
        self.iterate_inner(required, excluded, true, &mut callback)
    }

    /// Dispatch every behavior entity through the closed behavior set.
    /// Deactivated entities are skipped.
    pub fn run_behaviors(&mut self) -> Result<(), EcsError> {
        self.iterate_all(ComponentKind::Behavior.into(), Archetype::EMPTY, |queues, view| {
            let archetype = view.archetype();
            let has_active = archetype.contains(ComponentKind::Active);

            for row in 0..view.count() {
                if has_active
                    && view.column::<ActiveState>(ComponentKind::Active)[row].deactivated()
                {
                    continue;
                }

                let mut state = view.column::<BehaviorState>(ComponentKind::Behavior)[row];
                match BehaviorKind::from_raw(state.kind) {
                    BehaviorKind::Idle => {}
                    BehaviorKind::Spin => {
                        if !archetype.contains(ComponentKind::Rotation) {
                            continue;
                        }
                        let params: SpinParams = state.params();
                        let rotation = &mut view.column_mut::<Rot3>(ComponentKind::Rotation)[row];
                        rotation.x = rotation.x.wrapping_add(params.rate.x);
                        rotation.y = rotation.y.wrapping_add(params.rate.y);
                        rotation.z = rotation.z.wrapping_add(params.rate.z);
                    }
                    BehaviorKind::Pulse => {
                        if !archetype.contains(ComponentKind::Scale) {
                            continue;
                        }
                        let mut params: PulseParams = state.params();
                        let period = params.period.max(1);
                        params.phase = (params.phase + 1) % period;
                        // Triangle wave over the period: 0 -> 1 -> 0.
                        let t = params.phase as f32 / period as f32;
                        let wave = 1.0 - (2.0 * t - 1.0).abs();
                        view.column_mut::<f32>(ComponentKind::Scale)[row] =
                            params.base + params.amplitude * wave;
                        state.set_params(params);
                        view.column_mut::<BehaviorState>(ComponentKind::Behavior)[row] = state;
                    }
                    BehaviorKind::SelfDestruct => {
                        let mut params: SelfDestructParams = state.params();
                        params.ticks = params.ticks.saturating_sub(1);
                        if params.ticks == 0 {
                            queues.queue_delete(view.entities()[row]);
                        } else {
                            state.set_params(params);
                            view.column_mut::<BehaviorState>(ComponentKind::Behavior)[row] = state;
                        }
                    }
                }
            }
        })
    }

    /// Decrement every destroy timer, queueing deletion at zero.
    pub fn tick_destroy_timers(&mut self) -> Result<(), EcsError> {
        self.iterate(ComponentKind::DestroyTimer.into(), Archetype::EMPTY, |queues, view| {
            let ids: Vec<EntityId> = view.entities().to_vec();
            let timers = view.column_mut::<u16>(ComponentKind::DestroyTimer);
            for (row, timer) in timers.iter_mut().enumerate() {
                *timer = timer.wrapping_sub(1);
                if *timer == 0 {
                    queues.queue_delete(ids[row]);
                }
            }
        })
    }

    /// Tear down every entity and archetype: all store blocks return to
    /// the pool and the registry, table, and queues clear.
    pub fn reset(&mut self) {
        let mut stores = std::mem::take(&mut self.stores);
        for store in &mut stores {
            store.teardown(&mut self.pool);
        }
        self.entities.reset();
        self.queues.clear();
        info!("entity world reset");
    }

    /// Linear registry lookup, registering on miss. The registry is small
    /// and bounded, so the scan beats any map at real archetype counts.
    fn store_index(&mut self, archetype: Archetype) -> Result<usize, EcsError> {
        debug_assert!(!archetype.is_empty(), "entities need at least one component");
        if let Some(found) = self
            .stores
            .iter()
            .position(|store| store.archetype() == archetype)
        {
            return Ok(found);
        }
        if self.stores.len() == MAX_ARCHETYPES {
            return Err(EcsError::ArchetypeLimit {
                max: MAX_ARCHETYPES,
            });
        }

        let store = ColumnStore::new(archetype, &mut self.pool)?;
        debug!(?archetype, index = self.stores.len(), "registered archetype");
        self.counters.add("archetypes_registered", 1);
        self.stores.push(store);
        Ok(self.stores.len() - 1)
    }

    fn create_internal(
        &mut self,
        archetype: Archetype,
        count: usize,
        mut callback: Option<Callback<'_, '_>>,
    ) -> Result<Vec<EntityId>, EcsError> {
        assert!(count > 0, "creation of zero entities");

        let store_index = self.store_index(archetype)?;
        let first_index = self.stores[store_index].len();
        let ids = self
            .entities
            .alloc_batch(archetype, first_index as u32, count)
            .ok_or(EcsError::EntityTableFull { max: MAX_ENTITIES })?;

        if let Err(err) = self.stores[store_index].grow(&mut self.pool, count) {
            // Unwind the reservation so a failed create leaves no trace.
            for &id in ids.iter().rev() {
                self.entities.free(id);
            }
            return Err(err.into());
        }

        let kinds: Vec<ComponentKind> = archetype.kinds().collect();
        let sizes: Vec<usize> = kinds.iter().map(|kind| kind.size()).collect();
        let store = &self.stores[store_index];
        let ranges = store.column_ranges(&kinds);
        let capacity = store.capacity();

        let mut written = 0;
        while written < count {
            let logical = first_index + written;
            let chain = logical / capacity;
            let slot = logical % capacity;
            let range_count = (capacity - slot).min(count - written);

            let bytes = self.pool.block_bytes_mut(store.block(chain));
            let mut view =
                ColumnView::split(bytes, archetype, slot, range_count, &kinds, &sizes, &ranges);
            view.entities_mut()
                .copy_from_slice(&ids[written..written + range_count]);
            if let Some(callback) = callback.as_mut() {
                callback(&mut self.queues, &mut view);
            }
            written += range_count;
        }

        self.counters.add("entities_created", count as u64);
        Ok(ids)
    }

    fn iterate_inner(
        &mut self,
        required: Archetype,
        excluded: Archetype,
        all_components: bool,
        callback: Callback<'_, '_>,
    ) -> Result<(), EcsError> {
        debug_assert!(!self.in_iteration, "re-entrant entity iteration");
        self.in_iteration = true;
        self.queues.clear();

        // Snapshot of the registry; archetypes registered by queued
        // creations are not visited in this pass.
        let matching: Vec<usize> = self
            .stores
            .iter()
            .enumerate()
            .filter(|(_, store)| {
                store.archetype().contains_all(required)
                    && store.archetype().is_disjoint(excluded)
            })
            .map(|(index, _)| index)
            .collect();

        let required_kinds: Vec<ComponentKind> = required.kinds().collect();

        for store_index in matching {
            let store = &self.stores[store_index];
            let archetype = store.archetype();
            let kinds: Vec<ComponentKind> = if all_components {
                archetype.kinds().collect()
            } else {
                required_kinds.clone()
            };
            let sizes: Vec<usize> = kinds.iter().map(|kind| kind.size()).collect();
            let ranges = store.column_ranges(&kinds);

            for chain in 0..store.num_blocks() {
                let fill = store.block_fill(chain);
                let bytes = self.pool.block_bytes_mut(store.block(chain));
                let mut view =
                    ColumnView::split(bytes, archetype, 0, fill, &kinds, &sizes, &ranges);
                callback(&mut self.queues, &mut view);
            }
        }

        self.in_iteration = false;
        self.apply_queues()
    }

    /// Apply deferred mutations: all queued deletions first (duplicates
    /// were filtered at queue time), then the creation queue drained to a
    /// fixed point, since creation callbacks may enqueue further
    /// creations.
    fn apply_queues(&mut self) -> Result<(), EcsError> {
        for id in self.queues.take_deletions() {
            self.delete_entity(id);
        }
        while self.queues.has_creations() {
            for mut creation in self.queues.take_creations() {
                self.create_internal(
                    creation.archetype,
                    creation.count,
                    creation.callback.as_deref_mut(),
                )?;
            }
        }
        Ok(())
    }
}
