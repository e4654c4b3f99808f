//! Per-transaction execution context handed to merged commands

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::tx::{LowLevelTransaction, TxId, TxOutcome, TxResult};

const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Values computed by one command and reused by later ones in the same
/// transaction. Cleared by the merger at every transaction boundary.
pub struct CachedProperties {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
    capacity: usize,
    renewals: u64,
}

impl CachedProperties {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            renewals: 0,
        }
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the cache grew to its capacity and should be renewed
    pub fn need_clear(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Drop every entry, keeping the allocation
    pub fn clear_renew(&mut self) {
        self.entries.clear();
        self.renewals += 1;
    }

    /// Times the cache was cleared
    pub fn renewals(&self) -> u64 {
        self.renewals
    }
}

impl Default for CachedProperties {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TransactionContext<'a> {
    tx: &'a mut LowLevelTransaction,
    cached: &'a mut CachedProperties,
}

impl<'a> TransactionContext<'a> {
    pub fn new(tx: &'a mut LowLevelTransaction, cached: &'a mut CachedProperties) -> Self {
        Self { tx, cached }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx.id()
    }

    pub fn transaction(&mut self) -> &mut LowLevelTransaction {
        self.tx
    }

    pub fn cached_properties(&mut self) -> &mut CachedProperties {
        self.cached
    }

    pub fn can_continue(&self) -> bool {
        self.tx.can_continue()
    }

    /// Run `hook` when the enclosing transaction commits or rolls back
    pub fn on_dispose(&mut self, hook: impl FnOnce(TxOutcome) + Send + 'static) -> TxResult<()> {
        self.tx.on_dispose(hook)
    }
}
