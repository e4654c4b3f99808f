//! Storage environment
//!
//! Owns the data file, the journal writer, the committed version table and
//! the flusher thread, and hands out transactions over them.
//!
//! # Invariants Enforced
//!
//! - At most one write transaction exists at a time
//! - `last_committed` only advances after the journal append succeeded
//! - A reader's snapshot is registered under the same lock the flusher uses
//!   to pick its flush point, so versions it can see are never evicted early

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::journal::{
    recover, FlushJob, FlushMarker, FlushOutcome, FlusherHandle, JournalSnapshot, JournalWriter,
    PageApply,
};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry, ObservationScope};
use crate::report::StorageReport;
use crate::scratch::ScratchBufferPool;
use crate::storage::{Pager, StorageError};

use super::errors::{TxError, TxResult};
use super::state::{TransactionMode, TxId};
use super::transaction::LowLevelTransaction;
use super::versions::{ReaderRegistry, VersionTable};

pub(crate) struct EnvInner {
    pub(crate) config: EngineConfig,
    data_dir: PathBuf,
    pub(crate) pager: RwLock<Pager>,
    pub(crate) journal: Mutex<JournalWriter>,
    pub(crate) versions: RwLock<VersionTable>,
    pub(crate) last_committed: AtomicU64,
    pub(crate) readers: Mutex<ReaderRegistry>,
    pub(crate) writer_active: AtomicBool,
    /// Set when a journal append failed; no further writes are accepted
    pub(crate) failed: Mutex<Option<String>>,
    pub(crate) scratch: ScratchBufferPool,
    marker: Mutex<FlushMarker>,
    flush_lock: Mutex<()>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    flusher: Mutex<Option<FlusherHandle>>,
}

/// Shared handle to an open store
#[derive(Clone)]
pub struct StorageEnvironment {
    inner: Arc<EnvInner>,
}

impl StorageEnvironment {
    /// Open (or create) the store described by `config`.
    ///
    /// Journals newer than the flush marker are replayed into the data file
    /// before the journal writer starts a fresh file.
    pub fn open(config: EngineConfig) -> TxResult<Self> {
        Self::open_with_pool(config.clone(), ScratchBufferPool::new(config.scratch_limits()))
    }

    /// Open with an externally owned scratch pool
    pub fn open_with_pool(config: EngineConfig, scratch: ScratchBufferPool) -> TxResult<Self> {
        let data_dir = config.data_dir.clone();
        let journal_dir = config.journal_dir();
        let scope = ObservationScope::with_fields(
            "ENV_OPEN",
            &[("data_dir", &data_dir.display().to_string())],
        );

        let opened = Self::open_inner(config, scratch, &data_dir, &journal_dir);
        match opened {
            Ok(env) => {
                scope.complete_with_fields(&[(
                    "last_committed",
                    &env.last_committed().to_string(),
                )]);
                Logger::info(
                    Event::EnvReady.as_str(),
                    &[("data_dir", &data_dir.display().to_string())],
                );
                Ok(env)
            }
            Err(e) => {
                scope.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn open_inner(
        config: EngineConfig,
        scratch: ScratchBufferPool,
        data_dir: &Path,
        journal_dir: &Path,
    ) -> TxResult<Self> {
        Logger::info(
            Event::EnvOpen.as_str(),
            &[("data_dir", &data_dir.display().to_string())],
        );
        fs::create_dir_all(journal_dir).map_err(|e| {
            StorageError::io(
                format!("failed to create {}", journal_dir.display()),
                e,
            )
        })?;

        let mut pager = Pager::open(&config.data_file_path(), config.initial_data_pages)?;
        let marker = FlushMarker::read_from_dir(data_dir)?;
        let stats = recover(&mut pager, journal_dir, &marker).map_err(|e| {
            log_event_with_fields(Event::RecoveryFailed, &[("error", &e.to_string())]);
            e
        })?;
        let journal = JournalWriter::open(journal_dir, config.journal_config())?;
        let settings = config.flush_settings();

        let inner = Arc::new(EnvInner {
            data_dir: data_dir.to_path_buf(),
            pager: RwLock::new(pager),
            journal: Mutex::new(journal),
            versions: RwLock::new(VersionTable::new()),
            last_committed: AtomicU64::new(stats.last_transaction),
            readers: Mutex::new(ReaderRegistry::default()),
            writer_active: AtomicBool::new(false),
            failed: Mutex::new(None),
            scratch,
            marker: Mutex::new(marker),
            flush_lock: Mutex::new(()),
            metrics: Arc::new(MetricsRegistry::new()),
            flusher: Mutex::new(None),
            config,
        });

        let flusher = FlusherHandle::spawn(Arc::downgrade(&inner), settings)
            .map_err(|e| StorageError::io("failed to spawn flusher thread", e))?;
        *inner.flusher.lock() = Some(flusher);

        Ok(Self { inner })
    }

    /// Begin a read transaction at the latest committed snapshot
    pub fn read_transaction(&self) -> TxResult<LowLevelTransaction> {
        LowLevelTransaction::begin(Arc::clone(&self.inner), TransactionMode::Read)
    }

    /// Begin the single write transaction; `WriterBusy` if one is active
    pub fn write_transaction(&self) -> TxResult<LowLevelTransaction> {
        LowLevelTransaction::begin(Arc::clone(&self.inner), TransactionMode::ReadWrite)
    }

    /// Run one flush pass on the calling thread
    pub fn flush_now(&self) -> TxResult<FlushOutcome> {
        self.inner.flush()
    }

    /// fsync the journal; needed in deferred mode before relying on durability
    pub fn sync_journal(&self) -> TxResult<()> {
        self.inner.journal.lock().sync()?;
        self.inner.metrics.increment_journal_syncs();
        Ok(())
    }

    pub fn last_flushed(&self) -> FlushMarker {
        self.inner.marker.lock().clone()
    }

    pub fn last_committed(&self) -> TxId {
        self.inner.last_committed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn scratch_pool(&self) -> &ScratchBufferPool {
        &self.inner.scratch
    }

    pub fn journal_snapshots(&self) -> Vec<JournalSnapshot> {
        self.inner.journal.lock().snapshots()
    }

    pub fn recyclable_journals(&self) -> Vec<(u64, PathBuf)> {
        self.inner.journal.lock().recyclable()
    }

    pub fn unsynced_journal_bytes(&self) -> u64 {
        self.inner.journal.lock().unsynced_bytes()
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.inner.pager.read().path().to_path_buf()
    }

    pub fn allocated_pages(&self) -> u64 {
        self.inner.pager.read().number_of_allocated_pages()
    }

    /// Committed versions not yet applied to the data file
    pub fn unflushed_versions(&self) -> usize {
        self.inner.versions.read().len()
    }

    pub fn active_readers(&self) -> usize {
        self.inner.readers.lock().active()
    }

    pub fn storage_report(&self, detailed: bool) -> TxResult<StorageReport> {
        StorageReport::generate(self, detailed)
    }

    /// Stop the flusher, flush everything committed and sync the journal
    pub fn close(self) -> TxResult<()> {
        if let Some(mut flusher) = self.inner.flusher.lock().take() {
            flusher.stop();
        }
        self.inner.journal.lock().sync()?;
        self.inner.flush()?;
        Logger::info(
            Event::EnvClosed.as_str(),
            &[("last_committed", &self.last_committed().to_string())],
        );
        Ok(())
    }
}

impl EnvInner {
    /// Called after each commit; wakes the flusher once enough is unflushed
    pub(crate) fn committed(&self) {
        if self.versions.read().bytes() < self.config.flush.wake_after_bytes {
            return;
        }
        if let Some(flusher) = self.flusher.lock().as_ref() {
            flusher.notify();
        }
    }

    /// Highest transaction no live reader still needs from the version table
    fn flush_point(&self) -> TxId {
        let readers = self.readers.lock();
        let committed = self.last_committed.load(Ordering::Acquire);
        readers
            .oldest()
            .map_or(committed, |oldest| oldest.min(committed))
    }
}

impl FlushJob for EnvInner {
    type Error = TxError;

    fn flush(&self) -> Result<FlushOutcome, TxError> {
        let _guard = self.flush_lock.lock();

        let upto = self.flush_point();
        let previous = self.marker.lock().clone();
        if upto <= previous.last_flushed_transaction {
            return Ok(FlushOutcome {
                flushed_upto: previous.last_flushed_transaction,
                ..FlushOutcome::default()
            });
        }

        let scope = ObservationScope::with_fields("FLUSH", &[("upto", &upto.to_string())]);
        let entries = self.versions.read().collect_upto(upto);
        let written = {
            let mut pager = self.pager.write();
            let mut written = 0u64;
            let applied = entries.iter().try_for_each(|(_, entry)| {
                written += entry.page_span as u64;
                pager.apply_page(entry)
            });
            applied.and_then(|_| pager.sync_pages()).map(|_| written)
        };
        let pages_written = match written {
            Ok(pages) => pages,
            Err(e) => {
                self.metrics.increment_flush_failures();
                scope.fail(&e.to_string());
                return Err(e.into());
            }
        };

        let journal_number = self
            .journal
            .lock()
            .journal_for(upto)
            .unwrap_or(previous.last_flushed_journal);
        let marker = FlushMarker::new(upto, journal_number);
        if let Err(e) = marker.write_to_dir(&self.data_dir) {
            self.metrics.increment_flush_failures();
            scope.fail(&e.to_string());
            return Err(e.into());
        }
        *self.marker.lock() = marker;

        self.versions.write().evict_upto(upto);
        let retired = self.journal.lock().retire_flushed(upto)?;

        self.metrics.record_flush(pages_written);
        scope.complete_with_fields(&[
            ("pages", &pages_written.to_string()),
            ("journals_retired", &retired.len().to_string()),
        ]);
        Logger::info(
            Event::FlushComplete.as_str(),
            &[
                ("upto", &upto.to_string()),
                ("pages", &pages_written.to_string()),
            ],
        );

        Ok(FlushOutcome {
            flushed_upto: upto,
            pages_written,
            journals_retired: retired.len(),
        })
    }
}
