//! Storage report
//!
//! Read-only space accounting: data file pages, live journals, recyclable
//! journal files and scratch usage. `generate` reports on an open
//! environment under a read transaction; `inspect` reads the files of a
//! closed store without replaying or writing anything.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::EngineConfig;
use crate::journal::{
    journal_path, list_journals, recyclable_path, FlushMarker, JournalReader, JournalSnapshot,
};
use crate::scratch::ScratchBufferPoolInfo;
use crate::storage::{read_file_header, FileHeader, PAGE_SIZE};
use crate::tx::{StorageEnvironment, TxResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataFileReport {
    pub path: PathBuf,
    pub allocated_pages: u64,
    pub allocated_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub free_pages: u64,
    pub next_page_number: u64,
}

impl DataFileReport {
    /// Space accounting from the page counts of the file and its header.
    ///
    /// Pages at or past `next_page_number` were never handed out and count
    /// as free along with the free list.
    pub fn new(path: PathBuf, allocated_pages: u64, header: &FileHeader) -> Self {
        let page = PAGE_SIZE as u64;
        let handed_out = header.next_page_number.saturating_sub(1);
        let used_pages = handed_out.saturating_sub(header.free_pages);
        let free_pages = (header.free_pages + allocated_pages).saturating_sub(handed_out);

        Self {
            path,
            allocated_pages,
            allocated_bytes: allocated_pages * page,
            used_bytes: used_pages * page,
            free_bytes: free_pages * page,
            free_pages: header.free_pages,
            next_page_number: header.next_page_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalReport {
    pub number: u64,
    pub available_4kbs: u64,
    pub last_transaction: u64,
    pub allocated_bytes: u64,
}

impl From<JournalSnapshot> for JournalReport {
    fn from(snapshot: JournalSnapshot) -> Self {
        Self {
            number: snapshot.number,
            available_4kbs: snapshot.available_4kbs,
            last_transaction: snapshot.last_transaction,
            allocated_bytes: snapshot.allocated_bytes,
        }
    }
}

/// A file kept around for reuse
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TempFileReport {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl TempFileReport {
    fn of(path: PathBuf) -> Self {
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, size_bytes }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub data_file: DataFileReport,
    pub journals: Vec<JournalReport>,
    pub temp_files: Vec<TempFileReport>,
    /// Only present for an open environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch: Option<ScratchBufferPoolInfo>,
    pub last_committed_transaction: u64,
    pub last_flushed_transaction: u64,
    pub last_flushed_journal: u64,
    pub total_written_but_unsynced_bytes: u64,
    /// Per-run details, only in a detailed report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions: Option<VersionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReport {
    pub unflushed_versions: usize,
    pub active_readers: usize,
}

impl StorageReport {
    pub fn generate(env: &StorageEnvironment, detailed: bool) -> TxResult<Self> {
        let tx = env.read_transaction()?;
        let header = tx.header()?;
        let data_file = DataFileReport::new(env.data_file_path(), env.allocated_pages(), &header);

        let temp_files = env
            .recyclable_journals()
            .into_iter()
            .map(|(_, path)| TempFileReport::of(path))
            .collect();

        let marker = env.last_flushed();
        let versions = detailed.then(|| VersionReport {
            unflushed_versions: env.unflushed_versions(),
            active_readers: env.active_readers(),
        });

        Ok(Self {
            data_file,
            journals: env
                .journal_snapshots()
                .into_iter()
                .map(JournalReport::from)
                .collect(),
            temp_files,
            scratch: Some(env.scratch_pool().info()),
            last_committed_transaction: tx.snapshot(),
            last_flushed_transaction: marker.last_flushed_transaction,
            last_flushed_journal: marker.last_flushed_journal,
            total_written_but_unsynced_bytes: env.unsynced_journal_bytes(),
            versions,
        })
    }

    /// Report on a store that is not open, from its files alone.
    ///
    /// The data file section reflects what was flushed; committed
    /// transactions still in the journals show up in
    /// `last_committed_transaction` only.
    pub fn inspect(config: &EngineConfig) -> TxResult<Self> {
        let data_path = config.data_file_path();
        let (header, allocated_pages) = read_file_header(&data_path)?;
        let journal_dir = config.journal_dir();
        let journals = scan_journals(&journal_dir)?;
        let listing = list_journals(&journal_dir)?;
        let marker = FlushMarker::read_from_dir(&config.data_dir)?;

        let last_committed = journals
            .iter()
            .map(|j| j.last_transaction)
            .max()
            .unwrap_or(0)
            .max(marker.last_flushed_transaction);

        Ok(Self {
            data_file: DataFileReport::new(data_path, allocated_pages, &header),
            journals: journals.into_iter().map(JournalReport::from).collect(),
            temp_files: listing
                .recyclable
                .into_iter()
                .map(|n| TempFileReport::of(recyclable_path(&journal_dir, n)))
                .collect(),
            scratch: None,
            last_committed_transaction: last_committed,
            last_flushed_transaction: marker.last_flushed_transaction,
            last_flushed_journal: marker.last_flushed_journal,
            total_written_but_unsynced_bytes: 0,
            versions: None,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Snapshots of every live journal in `dir`, read without a writer
pub fn scan_journals(dir: &Path) -> TxResult<Vec<JournalSnapshot>> {
    let listing = list_journals(dir)?;
    let mut snapshots = Vec::with_capacity(listing.live.len());
    for number in listing.live {
        snapshots.push(JournalReader::scan(&journal_path(dir, number), number)?);
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    #[test]
    fn test_data_file_formulas() {
        let header = FileHeader {
            next_page_number: 11,
            freelist_head: 4,
            free_pages: 3,
        };
        let report = DataFileReport::new(PathBuf::from("data"), 16, &header);
        let page = PAGE_SIZE as u64;

        assert_eq!(report.allocated_bytes, 16 * page);
        assert_eq!(report.used_bytes, 7 * page);
        assert_eq!(report.free_bytes, 9 * page);
    }

    #[test]
    fn test_report_of_fresh_store() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.initial_data_pages = 8;
        config.flush.interval_ms = 60_000;
        let env = StorageEnvironment::open(config).unwrap();

        let mut tx = env.write_transaction().unwrap();
        tx.allocate_page(2).unwrap();
        tx.commit().unwrap();

        let report = env.storage_report(true).unwrap();
        assert_eq!(report.data_file.allocated_pages, 8);
        assert_eq!(report.data_file.used_bytes, 2 * PAGE_SIZE as u64);
        assert_eq!(report.last_committed_transaction, 1);
        assert_eq!(report.last_flushed_transaction, 0);
        assert_eq!(report.journals.len(), 1);
        assert_eq!(report.journals[0].last_transaction, 1);
        assert_eq!(report.versions.as_ref().unwrap().active_readers, 1);

        let json = report.to_json();
        assert!(json.contains("\"total_written_but_unsynced_bytes\""));
    }

    #[test]
    fn test_inspect_closed_store_leaves_files_alone() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.initial_data_pages = 8;
        config.flush.interval_ms = 60_000;
        let env = StorageEnvironment::open(config.clone()).unwrap();
        for _ in 0..2 {
            let mut tx = env.write_transaction().unwrap();
            tx.allocate_page(1).unwrap();
            tx.commit().unwrap();
        }
        env.close().unwrap();

        let before = list_journals(&config.journal_dir()).unwrap().live;
        let report = StorageReport::inspect(&config).unwrap();
        let after = list_journals(&config.journal_dir()).unwrap().live;

        assert_eq!(before, after);
        assert_eq!(report.journals.len(), before.len());
        assert_eq!(report.last_committed_transaction, 2);
        assert!(report.scratch.is_none());
        assert_eq!(report.data_file.allocated_pages, 8);
    }
}
