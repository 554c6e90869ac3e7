//! Ember Engine Core
//!
//! Contains the fundamental runtime memory systems:
//! - Block pool allocator (fixed region, contiguous-run allocation)
//! - Archetype-based entity component storage
//! - Deferred entity mutation queues

pub mod ecs;
pub mod pool;

pub use glam;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
