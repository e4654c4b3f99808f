//! Scratch buffer pool
//!
//! Arenas are handed to write transactions and returned when the transaction
//! ends. A returned arena is reset, not freed: its buffer keeps its size and
//! is given to the next transaction, up to `keep_arenas` buffers.
//!
//! The pool is an explicit, cloneable handle owned by the storage
//! environment. Tests create a fresh pool per case.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::arena::ScratchArena;

/// Size limits of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchLimits {
    /// Largest staging buffer a single transaction may use
    pub max_arena_bytes: usize,
    /// Bytes reserved by all arenas together, retained ones included
    pub max_total_bytes: usize,
    /// Reset arenas kept for reuse
    pub keep_arenas: usize,
}

impl Default for ScratchLimits {
    fn default() -> Self {
        Self {
            max_arena_bytes: 256 * 1024 * 1024,
            max_total_bytes: 1024 * 1024 * 1024,
            keep_arenas: 2,
        }
    }
}

/// Read-only view of pool usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScratchBufferPoolInfo {
    pub arenas_in_use: usize,
    pub retained_arenas: usize,
    pub reserved_bytes: usize,
    pub retained_bytes: usize,
    pub max_arena_bytes: usize,
    pub max_total_bytes: usize,
    pub arenas_created: u64,
    pub arenas_reused: u64,
}

pub(crate) struct PoolShared {
    pub(crate) limits: ScratchLimits,
    free: Mutex<Vec<Vec<u8>>>,
    pub(crate) reserved_bytes: AtomicUsize,
    in_use: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    next_id: AtomicU64,
}

impl PoolShared {
    /// Reserve `bytes` more against the pool limit
    pub(crate) fn try_reserve(&self, bytes: usize) -> bool {
        let limit = self.limits.max_total_bytes;
        self.reserved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    pub(crate) fn unreserve(&self, bytes: usize) {
        if bytes > 0 {
            self.reserved_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }

    pub(crate) fn arena_finished(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct ScratchBufferPool {
    shared: Arc<PoolShared>,
}

impl ScratchBufferPool {
    pub fn new(limits: ScratchLimits) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                limits,
                free: Mutex::new(Vec::new()),
                reserved_bytes: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn limits(&self) -> ScratchLimits {
        self.shared.limits
    }

    /// Take an arena, reusing a retained buffer when one exists
    pub fn acquire(&self) -> ScratchArena {
        let buffer = self.shared.free.lock().pop();
        let buffer = match buffer {
            Some(buffer) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        self.shared.in_use.fetch_add(1, Ordering::AcqRel);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        ScratchArena::new(id, Arc::clone(&self.shared), buffer)
    }

    /// Return an arena; it is reset and kept for reuse while there is room
    pub fn release(&self, mut arena: ScratchArena) {
        let buffer = arena.take_buffer();
        let mut free = self.shared.free.lock();
        if free.len() < self.shared.limits.keep_arenas && !buffer.is_empty() {
            free.push(buffer);
        } else {
            self.shared.unreserve(buffer.len());
        }
    }

    pub fn info(&self) -> ScratchBufferPoolInfo {
        let free = self.shared.free.lock();
        ScratchBufferPoolInfo {
            arenas_in_use: self.shared.in_use.load(Ordering::Acquire),
            retained_arenas: free.len(),
            reserved_bytes: self.shared.reserved_bytes.load(Ordering::Acquire),
            retained_bytes: free.iter().map(Vec::len).sum(),
            max_arena_bytes: self.shared.limits.max_arena_bytes,
            max_total_bytes: self.shared.limits.max_total_bytes,
            arenas_created: self.shared.created.load(Ordering::Relaxed),
            arenas_reused: self.shared.reused.load(Ordering::Relaxed),
        }
    }
}
