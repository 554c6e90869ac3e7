//! Fixed-capacity block pool allocation.
//!
//! The pool owns one contiguous memory region, carved into equal-size
//! blocks at startup. Every subsystem that needs memory claims whole
//! blocks (or contiguous runs of them) tagged with its [`OwnerTag`], and
//! releases them with a single call on the run's first block.

mod owner;
#[allow(clippy::module_inception)]
mod pool;

pub use owner::OwnerTag;
pub use pool::{BlockIndex, BlockPool, PoolError, BLOCK_SIZE};
