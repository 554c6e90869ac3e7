//! Entity Component System core types.
//!
//! Archetype-keyed columnar entity storage built directly on the block
//! pool. Entities with the same component set share one column store;
//! each store is a chain of pool blocks holding a back-reference array
//! plus one array per component kind. Identities are stable slot ids
//! into a global entity table, and structural mutation requested during
//! iteration is deferred through [`EntityQueues`].

mod archetype;
mod component;
mod entity;
mod queue;
mod storage;
mod world;

pub use archetype::Archetype;
pub use component::{
    ActiveState, BehaviorKind, BehaviorState, ComponentKind, GravityParams, PulseParams, Rot3,
    SelfDestructParams, SpinParams, BEHAVIOR_DATA_SIZE, COMPONENT_SIZES, NUM_COMPONENT_KINDS,
};
pub use entity::{EntityId, EntityRecord, EntityTable, MAX_ENTITIES};
pub use queue::{CreateCallback, EntityQueues, QueuedCreation};
pub use storage::{ColumnStore, ColumnView};
pub use world::{EcsError, World, MAX_ARCHETYPES};
