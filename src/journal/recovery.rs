//! Journal replay for crash recovery
//!
//! On startup every live journal is read in file-number order and the pages
//! of each transaction newer than the flush marker are written back into the
//! data file, which is then synced.
//!
//! - Replay is idempotent: a page image is written whole, so applying an
//!   already-flushed transaction again leaves the file unchanged
//! - Transaction ids must increase across the whole journal sequence
//! - The flush marker is not advanced here; the next flush does that

use std::path::Path;

use crate::observability::ObservationScope;
use crate::storage::{Pager, StorageError};

use super::errors::{JournalError, JournalResult};
use super::file::{journal_path, list_journals};
use super::marker::FlushMarker;
use super::reader::JournalReader;
use super::record::PageEntry;

/// Destination of replayed pages
pub trait PageApply {
    /// Write one page run as recorded in the journal
    fn apply_page(&mut self, entry: &PageEntry) -> Result<(), StorageError>;

    /// Make applied pages durable
    fn sync_pages(&mut self) -> Result<(), StorageError>;
}

impl PageApply for Pager {
    fn apply_page(&mut self, entry: &PageEntry) -> Result<(), StorageError> {
        self.write_pages(entry.page_number, &entry.bytes)
    }

    fn sync_pages(&mut self) -> Result<(), StorageError> {
        self.sync()
    }
}

/// Statistics from journal replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub journals_scanned: u64,
    pub transactions_replayed: u64,
    /// Transactions at or below the flush marker
    pub transactions_skipped: u64,
    pub pages_applied: u64,
    /// Highest transaction id seen in the journals or the marker
    pub last_transaction: u64,
}

pub struct JournalReplayer;

impl JournalReplayer {
    /// Replay every journal in `journal_dir` newer than `last_flushed`
    pub fn replay<S: PageApply>(
        journal_dir: &Path,
        last_flushed: u64,
        storage: &mut S,
    ) -> JournalResult<ReplayStats> {
        let listing = list_journals(journal_dir)?;
        let mut stats = ReplayStats {
            last_transaction: last_flushed,
            ..ReplayStats::default()
        };
        let mut previous_tx = 0u64;

        for number in listing.live {
            let mut reader = JournalReader::open(&journal_path(journal_dir, number), number)?;
            stats.journals_scanned += 1;

            while let Some(tx) = reader.read_next()? {
                if tx.tx_id <= previous_tx {
                    return Err(JournalError::corruption(format!(
                        "journal {} transaction {} does not follow {}",
                        number, tx.tx_id, previous_tx
                    )));
                }
                previous_tx = tx.tx_id;
                stats.last_transaction = stats.last_transaction.max(tx.tx_id);

                if tx.tx_id <= last_flushed {
                    stats.transactions_skipped += 1;
                    continue;
                }

                for entry in &tx.pages {
                    storage
                        .apply_page(entry)
                        .map_err(|e| JournalError::replay_failed(tx.tx_id, e))?;
                    stats.pages_applied += 1;
                }
                stats.transactions_replayed += 1;
            }
        }

        if stats.pages_applied > 0 {
            storage
                .sync_pages()
                .map_err(|e| JournalError::replay_failed(stats.last_transaction, e))?;
        }
        Ok(stats)
    }
}

/// Recover the data file from the journals after the flush marker
pub fn recover(
    pager: &mut Pager,
    journal_dir: &Path,
    marker: &FlushMarker,
) -> JournalResult<ReplayStats> {
    let scope = ObservationScope::with_fields(
        "RECOVERY",
        &[(
            "last_flushed_transaction",
            &marker.last_flushed_transaction.to_string(),
        )],
    );

    match JournalReplayer::replay(journal_dir, marker.last_flushed_transaction, pager) {
        Ok(stats) => {
            scope.complete_with_fields(&[
                ("journals", &stats.journals_scanned.to_string()),
                ("replayed", &stats.transactions_replayed.to_string()),
                ("skipped", &stats.transactions_skipped.to_string()),
                ("last_transaction", &stats.last_transaction.to_string()),
            ]);
            Ok(stats)
        }
        Err(e) => {
            scope.fail(&e.to_string());
            Err(e)
        }
    }
}
