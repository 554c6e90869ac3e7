// queue.rs - deferred entity mutation queues
//
// Iteration hands out direct column views into pool blocks, so creating
// or deleting entities mid-iteration would invalidate the addresses a
// callback is still using. Callbacks queue structural mutations here
// instead; the world applies them after the block walk completes.

use super::archetype::Archetype;
use super::entity::EntityId;
use super::storage::ColumnView;

/// Callback invoked once per contiguous range of newly created entities.
pub type CreateCallback = Box<dyn FnMut(&mut EntityQueues, &mut ColumnView<'_, '_>)>;

/// A creation request deferred until the current iteration completes.
pub struct QueuedCreation {
    pub archetype: Archetype,
    pub count: usize,
    pub callback: Option<CreateCallback>,
}

/// Single-instance deferred mutation queues, owned by the world and reset
/// at the start of every iteration pass.
#[derive(Default)]
pub struct EntityQueues {
    deletions: Vec<EntityId>,
    creations: Vec<QueuedCreation>,
}

impl EntityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity for deletion after the current iteration.
    ///
    /// Duplicates are filtered by an identity scan; the queue is cleared
    /// every pass and expected to stay small.
    pub fn queue_delete(&mut self, entity: EntityId) {
        if self.deletions.contains(&entity) {
            return;
        }
        self.deletions.push(entity);
    }

    /// Queue creation of `count` entities of `archetype`.
    pub fn queue_create(&mut self, archetype: Archetype, count: usize) {
        self.creations.push(QueuedCreation {
            archetype,
            count,
            callback: None,
        });
    }

    /// Queue creation with an initializer invoked per modified block range.
    ///
    /// The callback receives these queues again and may enqueue further
    /// creations; draining repeats until no more are produced.
    pub fn queue_create_with<F>(&mut self, archetype: Archetype, count: usize, callback: F)
    where
        F: FnMut(&mut EntityQueues, &mut ColumnView<'_, '_>) + 'static,
    {
        self.creations.push(QueuedCreation {
            archetype,
            count,
            callback: Some(Box::new(callback)),
        });
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletions.len()
    }

    pub fn pending_creations(&self) -> usize {
        self.creations.len()
    }

    pub(crate) fn clear(&mut self) {
        self.deletions.clear();
        self.creations.clear();
    }

    pub(crate) fn take_deletions(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.deletions)
    }

    pub(crate) fn take_creations(&mut self) -> Vec<QueuedCreation> {
        std::mem::take(&mut self.creations)
    }

    pub(crate) fn has_creations(&self) -> bool {
        !self.creations.is_empty()
    }
}
