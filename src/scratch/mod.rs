//! Scratch buffer pool for aerostore
//!
//! Write transactions stage copies of their dirty pages in a scratch arena
//! drawn from the pool. When the transaction ends the arena goes back to the
//! pool and is reclaimed, not freed.

mod arena;
mod pool;

pub use arena::{ScratchArena, ScratchError, ScratchSlot};
pub use pool::{ScratchBufferPool, ScratchBufferPoolInfo, ScratchLimits};
