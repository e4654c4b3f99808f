//! Identity rewrite rules for conflict retry
//!
//! When a command fails with a concurrency conflict, the merger asks it (and
//! pending commands of the same kind) to rewrite store-generated ids before
//! re-running. Which ids count as store-generated is decided here.

use uuid::Uuid;

pub const DEFAULT_IDENTITY_SEPARATOR: char = '/';

pub trait IdRetryPolicy: Send + Sync {
    /// Whether `id` was requested as a store-generated identity
    fn qualifies(&self, id: &str) -> bool;

    /// A replacement for `id` that cannot collide with existing ids
    fn rewrite(&self, id: &str) -> String;
}

/// Ids ending with the separator (e.g. `users/`) are identities; a retry
/// completes them with a random suffix.
#[derive(Debug, Clone, Copy)]
pub struct SuffixSeparatorPolicy {
    separator: char,
}

impl SuffixSeparatorPolicy {
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    pub fn separator(&self) -> char {
        self.separator
    }
}

impl Default for SuffixSeparatorPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTITY_SEPARATOR)
    }
}

impl IdRetryPolicy for SuffixSeparatorPolicy {
    fn qualifies(&self, id: &str) -> bool {
        id.len() > self.separator.len_utf8() && id.ends_with(self.separator)
    }

    fn rewrite(&self, id: &str) -> String {
        if !self.qualifies(id) {
            return id.to_string();
        }
        format!("{id}{}", Uuid::new_v4().simple())
    }
}
