//! Committed page versions and active readers
//!
//! Pages committed but not yet flushed live in the version table, keyed by
//! page number and committing transaction. A reader at snapshot `S` sees the
//! newest version `<= S`, falling back to the data file.
//!
//! The flusher may only apply and evict versions up to the oldest snapshot
//! still registered, so every version a live reader can see stays either in
//! the table or in the data file.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::journal::PageEntry;
use crate::storage::PageNumber;

use super::state::TxId;

#[derive(Debug, Clone)]
struct PageVersion {
    page_span: u32,
    bytes: Arc<[u8]>,
}

#[derive(Debug, Default)]
pub struct VersionTable {
    pages: HashMap<PageNumber, BTreeMap<TxId, PageVersion>>,
    versions: usize,
    bytes: u64,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the pages of a committed transaction visible
    pub fn publish(&mut self, tx_id: TxId, entries: &[PageEntry]) {
        for entry in entries {
            let previous = self.pages.entry(entry.page_number).or_default().insert(
                tx_id,
                PageVersion {
                    page_span: entry.page_span,
                    bytes: Arc::clone(&entry.bytes),
                },
            );
            match previous {
                Some(old) => self.bytes -= old.bytes.len() as u64,
                None => self.versions += 1,
            }
            self.bytes += entry.bytes.len() as u64;
        }
    }

    /// Newest version of `page_number` visible at `snapshot`
    pub fn get(&self, page_number: PageNumber, snapshot: TxId) -> Option<(u32, Arc<[u8]>)> {
        self.pages
            .get(&page_number)?
            .range(..=snapshot)
            .next_back()
            .map(|(_, v)| (v.page_span, Arc::clone(&v.bytes)))
    }

    /// Every version up to `upto`, in commit order
    pub fn collect_upto(&self, upto: TxId) -> Vec<(TxId, PageEntry)> {
        let mut collected: Vec<(TxId, PageEntry)> = self
            .pages
            .iter()
            .flat_map(|(page_number, versions)| {
                versions.range(..=upto).map(move |(tx_id, v)| {
                    (
                        *tx_id,
                        PageEntry {
                            page_number: *page_number,
                            page_span: v.page_span,
                            bytes: Arc::clone(&v.bytes),
                        },
                    )
                })
            })
            .collect();
        collected.sort_by_key(|(tx_id, entry)| (*tx_id, entry.page_number));
        collected
    }

    /// Drop every version up to `upto`; they must already be in the data file
    pub fn evict_upto(&mut self, upto: TxId) {
        let mut removed = 0;
        let mut removed_bytes = 0;
        self.pages.retain(|_, versions| {
            let keep = versions.split_off(&(upto + 1));
            removed += versions.len();
            removed_bytes += versions.values().map(|v| v.bytes.len() as u64).sum::<u64>();
            *versions = keep;
            !versions.is_empty()
        });
        self.versions -= removed;
        self.bytes -= removed_bytes;
    }

    /// Number of stored versions
    pub fn len(&self) -> usize {
        self.versions
    }

    pub fn is_empty(&self) -> bool {
        self.versions == 0
    }

    /// Bytes held by stored versions
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Snapshots held by live read transactions
#[derive(Debug, Default)]
pub struct ReaderRegistry {
    snapshots: BTreeMap<TxId, usize>,
}

impl ReaderRegistry {
    pub fn register(&mut self, snapshot: TxId) {
        *self.snapshots.entry(snapshot).or_insert(0) += 1;
    }

    pub fn unregister(&mut self, snapshot: TxId) {
        if let Some(count) = self.snapshots.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                self.snapshots.remove(&snapshot);
            }
        }
    }

    pub fn oldest(&self) -> Option<TxId> {
        self.snapshots.keys().next().copied()
    }

    pub fn active(&self) -> usize {
        self.snapshots.values().sum()
    }
}
