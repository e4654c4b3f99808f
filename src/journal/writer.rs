//! Journal writer
//!
//! Appends committed transactions to the current journal file, rotating to a
//! new numbered file when a record does not fit. A process never appends to
//! journal files left by an earlier process: `open` always starts file
//! `max + 1`, reusing a recyclable file when one is available.
//!
//! Durability depends on [`SyncMode`]:
//! - `Immediate`: every append is followed by fsync before it returns
//! - `Deferred`: appends accumulate unsynced bytes until `sync()`; callers
//!   watch `needs_sync()` and sync before the window grows past the limit

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::observability::{Event, Logger};

use super::errors::{JournalError, JournalResult};
use super::file::{list_journals, journal_path, recyclable_path, sync_dir, JournalFile, JournalSnapshot};
use super::reader::JournalReader;
use super::record::{JournalTransaction, UNIT_SIZE};

/// Durability barrier applied after an append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Immediate,
    Deferred,
}

/// Journal settings taken from the engine configuration
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub file_size_bytes: u64,
    pub sync_mode: SyncMode,
    pub max_unsynced_bytes: u64,
    pub max_recyclable_journals: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file_size_bytes: 64 * 1024 * 1024,
            sync_mode: SyncMode::Immediate,
            max_unsynced_bytes: 32 * 1024 * 1024,
            max_recyclable_journals: 2,
        }
    }
}

pub struct JournalWriter {
    dir: PathBuf,
    config: JournalConfig,
    current: JournalFile,
    /// Live files before the current one, ascending by number
    closed: Vec<JournalSnapshot>,
    recyclable: Vec<u64>,
    unsynced_bytes: u64,
    total_written: u64,
}

impl JournalWriter {
    /// Open the journal directory and start a fresh journal file.
    pub fn open(dir: &Path, config: JournalConfig) -> JournalResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            JournalError::append_failed(
                format!("failed to create journal directory {}", dir.display()),
                e,
            )
        })?;

        let listing = list_journals(dir)?;
        let mut closed = Vec::with_capacity(listing.live.len());
        for number in &listing.live {
            closed.push(JournalReader::scan(&journal_path(dir, *number), *number)?);
        }

        let mut recyclable = listing.recyclable;
        let next_number = listing.live.last().map(|n| n + 1).unwrap_or(1);
        let reuse = recyclable.pop().map(|n| recyclable_path(dir, n));
        let current = JournalFile::create(dir, next_number, config.file_size_bytes, reuse.as_deref())?;

        Logger::info(
            Event::JournalRotate.as_str(),
            &[
                ("journal", &next_number.to_string()),
                ("existing", &closed.len().to_string()),
            ],
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            current,
            closed,
            recyclable,
            unsynced_bytes: 0,
            total_written: 0,
        })
    }

    /// Append one transaction, returning the bytes written
    pub fn append(&mut self, tx: &JournalTransaction) -> JournalResult<u64> {
        let len = tx.encoded_len();
        if !self.current.fits(len) {
            self.rotate(len)?;
        }

        let record = tx.encode(self.current.number());
        self.current.write_record(tx.tx_id, &record)?;
        self.unsynced_bytes += len;
        self.total_written += len;

        Logger::trace(
            Event::JournalAppend.as_str(),
            &[
                ("tx_id", &tx.tx_id.to_string()),
                ("journal", &self.current.number().to_string()),
                ("bytes", &len.to_string()),
            ],
        );

        if self.config.sync_mode == SyncMode::Immediate {
            self.sync()?;
        }
        Ok(len)
    }

    /// fsync the current journal file
    pub fn sync(&mut self) -> JournalResult<()> {
        if self.unsynced_bytes == 0 {
            return Ok(());
        }
        self.current.sync()?;
        if self.config.sync_mode == SyncMode::Deferred {
            Logger::trace(
                Event::JournalSync.as_str(),
                &[("bytes", &self.unsynced_bytes.to_string())],
            );
        }
        self.unsynced_bytes = 0;
        Ok(())
    }

    /// Bytes appended since the last fsync
    pub fn unsynced_bytes(&self) -> u64 {
        self.unsynced_bytes
    }

    /// Whether unsynced bytes reached the configured limit
    pub fn needs_sync(&self) -> bool {
        self.unsynced_bytes >= self.config.max_unsynced_bytes
    }

    /// Total bytes appended by this writer
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn current_number(&self) -> u64 {
        self.current.number()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.config.sync_mode
    }

    /// Snapshots of every live journal, oldest first
    pub fn snapshots(&self) -> Vec<JournalSnapshot> {
        let mut all = self.closed.clone();
        all.push(self.current.snapshot());
        all
    }

    /// Recyclable journal files waiting for reuse
    pub fn recyclable(&self) -> Vec<(u64, PathBuf)> {
        self.recyclable
            .iter()
            .map(|n| (*n, recyclable_path(&self.dir, *n)))
            .collect()
    }

    /// Number of the journal that recorded `tx_id`, if it is still live
    pub fn journal_for(&self, tx_id: u64) -> Option<u64> {
        self.snapshots()
            .into_iter()
            .find(|s| s.last_transaction >= tx_id && s.last_transaction != 0)
            .map(|s| s.number)
    }

    /// Retire closed journals whose transactions are all flushed.
    ///
    /// Up to `max_recyclable_journals` retired files are kept for reuse; the
    /// rest are deleted. Returns the retired journal numbers.
    pub fn retire_flushed(&mut self, last_flushed: u64) -> JournalResult<Vec<u64>> {
        let (retire, keep): (Vec<_>, Vec<_>) = self
            .closed
            .drain(..)
            .partition(|s| s.last_transaction <= last_flushed);
        self.closed = keep;

        let mut retired = Vec::with_capacity(retire.len());
        for snapshot in retire {
            let path = journal_path(&self.dir, snapshot.number);
            if self.recyclable.len() < self.config.max_recyclable_journals {
                let target = recyclable_path(&self.dir, snapshot.number);
                fs::rename(&path, &target).map_err(|e| {
                    JournalError::append_failed(
                        format!("failed to recycle journal {}", snapshot.number),
                        e,
                    )
                })?;
                self.recyclable.push(snapshot.number);
            } else {
                fs::remove_file(&path).map_err(|e| {
                    JournalError::append_failed(
                        format!("failed to delete journal {}", snapshot.number),
                        e,
                    )
                })?;
            }
            Logger::info(
                Event::JournalRecycled.as_str(),
                &[("journal", &snapshot.number.to_string())],
            );
            retired.push(snapshot.number);
        }

        if !retired.is_empty() {
            sync_dir(&self.dir)?;
        }
        Ok(retired)
    }

    fn rotate(&mut self, record_len: u64) -> JournalResult<()> {
        self.sync()?;

        let number = self.current.number() + 1;
        let size = self
            .config
            .file_size_bytes
            .max(record_len + UNIT_SIZE as u64);
        let reuse = self.recyclable.pop().map(|n| recyclable_path(&self.dir, n));
        let next = JournalFile::create(&self.dir, number, size, reuse.as_deref())?;

        let previous = std::mem::replace(&mut self.current, next);
        self.closed.push(previous.snapshot());

        Logger::info(
            Event::JournalRotate.as_str(),
            &[
                ("journal", &number.to_string()),
                ("reused", &reuse.is_some().to_string()),
            ],
        );
        Ok(())
    }
}
