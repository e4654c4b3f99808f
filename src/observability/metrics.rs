//! Counters for the storage engine
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Thread-safe, lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Registry of operational counters.
///
/// Uses Relaxed ordering; counters are observational only.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    journal_bytes_written: AtomicU64,
    journal_syncs: AtomicU64,
    journal_rotations: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    pages_flushed: AtomicU64,
    commands_executed: AtomicU64,
    commands_retried: AtomicU64,
    commands_failed: AtomicU64,
    batches_failed: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Transactions

    pub fn increment_commits(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rollbacks(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    // Journal

    pub fn add_journal_bytes(&self, bytes: u64) {
        self.journal_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_journal_syncs(&self) {
        self.journal_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_journal_rotations(&self) {
        self.journal_rotations.fetch_add(1, Ordering::Relaxed);
    }

    // Flush

    pub fn record_flush(&self, pages: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.pages_flushed.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn increment_flush_failures(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Merger

    pub fn add_commands_executed(&self, count: u64) {
        self.commands_executed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_commands_retried(&self) {
        self.commands_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commands_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            journal_bytes_written: self.journal_bytes_written.load(Ordering::Relaxed),
            journal_syncs: self.journal_syncs.load(Ordering::Relaxed),
            journal_rotations: self.journal_rotations.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            commands_retried: self.commands_retried.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }

    /// Snapshot rendered as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub journal_bytes_written: u64,
    pub journal_syncs: u64,
    pub journal_rotations: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub pages_flushed: u64,
    pub commands_executed: u64,
    pub commands_retried: u64,
    pub commands_failed: u64,
    pub batches_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_is_zeroed() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.transactions_committed, 0);
        assert_eq!(snapshot.journal_bytes_written, 0);
        assert_eq!(snapshot.commands_executed, 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.increment_commits();
        registry.increment_commits();
        registry.add_journal_bytes(4096);
        registry.record_flush(3);
        registry.record_flush(2);
        registry.add_commands_executed(5);
        registry.increment_commands_retried();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.transactions_committed, 2);
        assert_eq!(snapshot.journal_bytes_written, 4096);
        assert_eq!(snapshot.flushes, 2);
        assert_eq!(snapshot.pages_flushed, 5);
        assert_eq!(snapshot.commands_executed, 5);
        assert_eq!(snapshot.commands_retried, 1);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.add_journal_bytes(1234);

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["journal_bytes_written"], 1234);
        assert_eq!(parsed["flushes"], 0);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        reg.increment_commits();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().transactions_committed, 800);
    }
}
