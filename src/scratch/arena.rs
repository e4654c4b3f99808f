//! Scratch arenas
//!
//! An arena is a page-granular bump allocator over one byte buffer. Slots are
//! addressed by page position inside the arena and every access is
//! bounds-checked against the slot table.

use std::sync::Arc;

use thiserror::Error;

use crate::storage::PAGE_SIZE;

use super::pool::PoolShared;

/// Fraction of `max_arena_bytes` at which a transaction should stop growing
const NEAR_LIMIT_PERCENT: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScratchError {
    #[error("scratch {scope} exhausted: requested {requested} bytes, {used} in use, limit {limit}")]
    Exhausted {
        scope: &'static str,
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("scratch slot {position}+{count} outside arena of {pages} pages")]
    OutOfBounds {
        position: usize,
        count: usize,
        pages: usize,
    },
}

/// Pages `position..position + count` of an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchSlot {
    pub position: usize,
    pub count: usize,
}

impl ScratchSlot {
    pub fn byte_range(&self) -> std::ops::Range<usize> {
        self.position * PAGE_SIZE..(self.position + self.count) * PAGE_SIZE
    }
}

pub struct ScratchArena {
    id: u64,
    pool: Arc<PoolShared>,
    buffer: Vec<u8>,
    used_pages: usize,
}

impl ScratchArena {
    pub(crate) fn new(id: u64, pool: Arc<PoolShared>, buffer: Vec<u8>) -> Self {
        Self {
            id,
            pool,
            buffer,
            used_pages: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Allocate `count` zeroed pages
    pub fn allocate(&mut self, count: usize) -> Result<ScratchSlot, ScratchError> {
        let requested = count * PAGE_SIZE;
        let needed = (self.used_pages + count) * PAGE_SIZE;
        let max_arena = self.pool.limits.max_arena_bytes;
        if needed > max_arena {
            return Err(ScratchError::Exhausted {
                scope: "arena",
                requested,
                used: self.used_bytes(),
                limit: max_arena,
            });
        }

        if needed > self.buffer.len() {
            let growth = needed - self.buffer.len();
            if !self.pool.try_reserve(growth) {
                return Err(ScratchError::Exhausted {
                    scope: "pool",
                    requested,
                    used: self.pool.reserved_bytes.load(std::sync::atomic::Ordering::Acquire),
                    limit: self.pool.limits.max_total_bytes,
                });
            }
            self.buffer.resize(needed, 0);
        }

        let slot = ScratchSlot {
            position: self.used_pages,
            count,
        };
        self.buffer[slot.byte_range()].fill(0);
        self.used_pages += count;
        Ok(slot)
    }

    pub fn slice(&self, slot: ScratchSlot) -> Result<&[u8], ScratchError> {
        self.check(slot)?;
        Ok(&self.buffer[slot.byte_range()])
    }

    pub fn slice_mut(&mut self, slot: ScratchSlot) -> Result<&mut [u8], ScratchError> {
        self.check(slot)?;
        Ok(&mut self.buffer[slot.byte_range()])
    }

    pub fn used_bytes(&self) -> usize {
        self.used_pages * PAGE_SIZE
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Whether usage reached the near-limit threshold of `max_arena_bytes`
    pub fn near_limit(&self) -> bool {
        self.used_bytes() * 100 >= self.pool.limits.max_arena_bytes * NEAR_LIMIT_PERCENT
    }

    /// Forget every slot above `used_pages`, keeping the buffer
    pub fn truncate(&mut self, used_pages: usize) {
        self.used_pages = self.used_pages.min(used_pages);
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        self.used_pages = 0;
        std::mem::take(&mut self.buffer)
    }

    fn check(&self, slot: ScratchSlot) -> Result<(), ScratchError> {
        if slot.count == 0 || slot.position + slot.count > self.used_pages {
            return Err(ScratchError::OutOfBounds {
                position: slot.position,
                count: slot.count,
                pages: self.used_pages,
            });
        }
        Ok(())
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        self.pool.unreserve(self.buffer.len());
        self.pool.arena_finished();
    }
}

#[cfg(test)]
mod tests {
    use crate::scratch::{ScratchBufferPool, ScratchError, ScratchLimits, ScratchSlot};
    use crate::storage::PAGE_SIZE;

    fn pool(max_arena_pages: usize) -> ScratchBufferPool {
        ScratchBufferPool::new(ScratchLimits {
            max_arena_bytes: max_arena_pages * PAGE_SIZE,
            max_total_bytes: 100 * PAGE_SIZE,
            keep_arenas: 2,
        })
    }

    #[test]
    fn test_allocate_sequential_slots() {
        let pool = pool(10);
        let mut arena = pool.acquire();
        let a = arena.allocate(1).unwrap();
        let b = arena.allocate(3).unwrap();
        assert_eq!(a, ScratchSlot { position: 0, count: 1 });
        assert_eq!(b, ScratchSlot { position: 1, count: 3 });
        assert_eq!(arena.used_bytes(), 4 * PAGE_SIZE);
    }

    #[test]
    fn test_slots_are_independent() {
        let pool = pool(10);
        let mut arena = pool.acquire();
        let a = arena.allocate(1).unwrap();
        let b = arena.allocate(1).unwrap();
        arena.slice_mut(a).unwrap().fill(7);
        assert!(arena.slice(b).unwrap().iter().all(|x| *x == 0));
        assert!(arena.slice(a).unwrap().iter().all(|x| *x == 7));
    }

    #[test]
    fn test_arena_limit() {
        let pool = pool(4);
        let mut arena = pool.acquire();
        arena.allocate(3).unwrap();
        let err = arena.allocate(2).unwrap_err();
        assert!(matches!(err, ScratchError::Exhausted { scope: "arena", .. }));
    }

    #[test]
    fn test_near_limit_at_eighty_percent() {
        let pool = pool(10);
        let mut arena = pool.acquire();
        arena.allocate(7).unwrap();
        assert!(!arena.near_limit());
        arena.allocate(1).unwrap();
        assert!(arena.near_limit());
    }

    #[test]
    fn test_reused_slot_is_zeroed() {
        let pool = pool(10);
        let mut arena = pool.acquire();
        let slot = arena.allocate(1).unwrap();
        arena.slice_mut(slot).unwrap().fill(0xEE);
        pool.release(arena);

        let mut arena = pool.acquire();
        let slot = arena.allocate(1).unwrap();
        assert!(arena.slice(slot).unwrap().iter().all(|x| *x == 0));
    }

    #[test]
    fn test_out_of_bounds_slot() {
        let pool = pool(10);
        let mut arena = pool.acquire();
        arena.allocate(1).unwrap();
        let bogus = ScratchSlot { position: 1, count: 1 };
        assert!(matches!(arena.slice(bogus), Err(ScratchError::OutOfBounds { .. })));
    }

    #[test]
    fn test_truncate_forgets_later_slots() {
        let pool = pool(10);
        let mut arena = pool.acquire();
        arena.allocate(2).unwrap();
        let later = arena.allocate(2).unwrap();
        arena.truncate(2);
        assert!(arena.slice(later).is_err());
        assert_eq!(arena.allocate(1).unwrap().position, 2);
    }
}
