//! Low-level page transactions
//!
//! A read transaction pins the snapshot it started at. A write transaction
//! stages copy-on-write images of every page it touches in a scratch arena;
//! nothing becomes visible to other transactions until `commit` has appended
//! the dirty set to the journal.
//!
//! # Savepoints
//!
//! A savepoint records the dirty map, the arena high-water mark and the
//! header. After a savepoint, the first write to a page staged before it
//! copies the page into a new slot, so rolling back is a matter of restoring
//! the map and truncating the arena.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::journal::{JournalTransaction, PageEntry, SyncMode};
use crate::observability::{log_event_with_fields, Event};
use crate::scratch::{ScratchArena, ScratchSlot};
use crate::storage::{
    FileHeader, FreeList, PageAccess, PageFlags, PageHeader, PageNumber, PageRef, StorageError,
    HEADER_PAGE, PAGE_HEADER_SIZE, PAGE_SIZE,
};

use super::env::EnvInner;
use super::errors::{TxError, TxResult};
use super::state::{TransactionMode, TxId, TxOutcome, TxState};

/// Callback run exactly once when a write transaction ends
pub type DisposeHook = Box<dyn FnOnce(TxOutcome) + Send>;

/// Page content returned by `get_page`
pub enum PageView<'a> {
    /// Staged by this transaction
    Borrowed(&'a [u8]),
    /// A committed version not yet flushed
    Shared(Arc<[u8]>),
    /// Copied out of the data file
    Owned(Vec<u8>),
}

impl Deref for PageView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageView::Borrowed(bytes) => *bytes,
            PageView::Shared(bytes) => &bytes[..],
            PageView::Owned(bytes) => bytes.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DirtyPage {
    page_ref: PageRef,
    slot: ScratchSlot,
}

struct Savepoint {
    dirty: BTreeMap<PageNumber, DirtyPage>,
    arena_used_pages: usize,
    header: FileHeader,
    header_dirty: bool,
    hooks_len: usize,
}

struct WriteState {
    arena: Option<ScratchArena>,
    dirty: BTreeMap<PageNumber, DirtyPage>,
    header: FileHeader,
    header_dirty: bool,
    hooks: Vec<DisposeHook>,
    started: Instant,
    savepoint: Option<Savepoint>,
}

pub struct LowLevelTransaction {
    env: Arc<EnvInner>,
    id: TxId,
    mode: TransactionMode,
    state: TxState,
    /// Last committed transaction visible to this one
    snapshot: TxId,
    write: Option<WriteState>,
}

impl LowLevelTransaction {
    pub(crate) fn begin(env: Arc<EnvInner>, mode: TransactionMode) -> TxResult<Self> {
        match mode {
            TransactionMode::Read => {
                let snapshot = {
                    let mut readers = env.readers.lock();
                    let snapshot = env.last_committed.load(Ordering::Acquire);
                    readers.register(snapshot);
                    snapshot
                };
                Ok(Self {
                    env,
                    id: snapshot,
                    mode,
                    state: TxState::Active,
                    snapshot,
                    write: None,
                })
            }
            TransactionMode::ReadWrite => {
                if let Some(reason) = env.failed.lock().clone() {
                    return Err(TxError::Failed(reason));
                }
                if env
                    .writer_active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(TxError::WriterBusy);
                }

                let snapshot = env.last_committed.load(Ordering::Acquire);
                let header = match read_committed(&env, PageRef::single(HEADER_PAGE), snapshot)
                    .and_then(|bytes| FileHeader::read(&bytes).map_err(TxError::from))
                {
                    Ok(header) => header,
                    Err(e) => {
                        env.writer_active.store(false, Ordering::Release);
                        return Err(e);
                    }
                };
                let arena = env.scratch.acquire();

                Ok(Self {
                    id: snapshot + 1,
                    mode,
                    state: TxState::Active,
                    snapshot,
                    write: Some(WriteState {
                        arena: Some(arena),
                        dirty: BTreeMap::new(),
                        header,
                        header_dirty: false,
                        hooks: Vec::new(),
                        started: Instant::now(),
                        savepoint: None,
                    }),
                    env,
                })
            }
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Last committed transaction this one observes
    pub fn snapshot(&self) -> TxId {
        self.snapshot
    }

    /// File header as seen by this transaction
    pub fn header(&self) -> TxResult<FileHeader> {
        match &self.write {
            Some(write) => Ok(write.header),
            None => {
                let page = read_committed(&self.env, PageRef::single(HEADER_PAGE), self.snapshot)?;
                Ok(FileHeader::read(&page)?)
            }
        }
    }

    /// Content of `page_ref` as seen by this transaction
    pub fn get_page(&self, page_ref: PageRef) -> TxResult<PageView<'_>> {
        self.ensure_active("read")?;
        if let Some(write) = &self.write {
            if let Some(dirty) = write.dirty.get(&page_ref.number) {
                check_span(dirty.page_ref, page_ref)?;
                let arena = write_arena(write)?;
                return Ok(PageView::Borrowed(arena.slice(dirty.slot)?));
            }
        }

        let versioned = self.env.versions.read().get(page_ref.number, self.snapshot);
        match versioned {
            Some((span, bytes)) => {
                check_span(PageRef::overflow(page_ref.number, span), page_ref)?;
                Ok(PageView::Shared(bytes))
            }
            None => Ok(PageView::Owned(self.env.pager.read().read_pages(page_ref)?)),
        }
    }

    /// Writable copy of an existing page run
    pub fn page_mut(&mut self, page_ref: PageRef) -> TxResult<&mut [u8]> {
        self.ensure_writable("modify a page")?;
        self.check_bounds(page_ref)?;
        self.cow_page(page_ref)
    }

    /// Stage a copy of `page_ref`, or reuse the staged one
    fn cow_page(&mut self, page_ref: PageRef) -> TxResult<&mut [u8]> {
        let snapshot = self.snapshot;
        let env = Arc::clone(&self.env);
        let write = self.write_state_mut()?;
        let barrier = savepoint_barrier(write);

        let slot = match write.dirty.get(&page_ref.number).copied() {
            Some(dirty) => {
                check_span(dirty.page_ref, page_ref)?;
                if dirty.slot.position < barrier {
                    let arena = write_arena_mut(write)?;
                    let fresh = arena.allocate(page_ref.count as usize)?;
                    let previous = arena.slice(dirty.slot)?.to_vec();
                    arena.slice_mut(fresh)?.copy_from_slice(&previous);
                    write.dirty.insert(page_ref.number, DirtyPage { page_ref, slot: fresh });
                    fresh
                } else {
                    dirty.slot
                }
            }
            None => {
                let committed = read_committed(&env, page_ref, snapshot)?;
                let arena = write_arena_mut(write)?;
                let slot = arena.allocate(page_ref.count as usize)?;
                arena.slice_mut(slot)?.copy_from_slice(&committed);
                write.dirty.insert(page_ref.number, DirtyPage { page_ref, slot });
                slot
            }
        };

        Ok(write_arena_mut(write)?.slice_mut(slot)?)
    }

    /// Allocate `count` contiguous pages, stamped with a page header
    pub fn allocate_page(&mut self, count: u32) -> TxResult<PageRef> {
        self.ensure_writable("allocate a page")?;
        if count == 0 {
            let next = self.header()?.next_page_number;
            return Err(StorageError::out_of_bounds(next, 0, next).into());
        }
        let safe_before = self.safe_before_tx();
        let mut header = self.write_state_mut()?.header;

        let page_ref = FreeList::allocate(self, &mut header, count, safe_before)?;
        self.set_header(header)?;

        let page = self.fresh_run(page_ref)?;
        let page_header = if count == 1 {
            PageHeader::new(page_ref.number, PageFlags::Single)
        } else {
            PageHeader::overflow(
                page_ref.number,
                (page_ref.byte_len() - PAGE_HEADER_SIZE) as u32,
            )
        };
        page_header.write(page);
        Ok(page_ref)
    }

    /// Return every page of `page_ref` to the free list
    pub fn free_page(&mut self, page_ref: PageRef) -> TxResult<()> {
        self.ensure_writable("free a page")?;
        self.check_bounds(page_ref)?;
        let header = self.header()?;
        FreeList::check_free(&*self, &header, page_ref)?;

        let write = self.write_state_mut()?;
        write
            .dirty
            .retain(|number, _| !page_ref.contains(*number));

        let mut header = write.header;
        let freed_at = self.id;
        FreeList::free(self, &mut header, page_ref, freed_at)?;
        self.set_header(header)
    }

    /// Whether the transaction can take more work without exceeding its limits
    pub fn can_continue(&self) -> bool {
        let Some(write) = &self.write else {
            return false;
        };
        if self.state != TxState::Active {
            return false;
        }

        let config = &self.env.config;
        let dirty_bytes: u64 = write
            .dirty
            .values()
            .map(|d| d.page_ref.byte_len() as u64)
            .sum();
        if dirty_bytes >= config.max_transaction_size_bytes {
            return false;
        }
        if write.arena.as_ref().map_or(true, |a| a.near_limit()) {
            return false;
        }
        if self.env.journal.lock().needs_sync() {
            return false;
        }
        write.started.elapsed() < config.max_transaction_duration()
    }

    /// Register a hook run once with the outcome of this transaction
    pub fn on_dispose(&mut self, hook: impl FnOnce(TxOutcome) + Send + 'static) -> TxResult<()> {
        self.ensure_writable("register a hook")?;
        self.write_state_mut()?.hooks.push(Box::new(hook));
        Ok(())
    }

    /// Mark the current state; a later savepoint replaces this one
    pub fn savepoint(&mut self) -> TxResult<()> {
        self.ensure_writable("take a savepoint")?;
        let write = self.write_state_mut()?;
        let arena_used_pages = write_arena(write)?.used_pages();
        write.savepoint = Some(Savepoint {
            dirty: write.dirty.clone(),
            arena_used_pages,
            header: write.header,
            header_dirty: write.header_dirty,
            hooks_len: write.hooks.len(),
        });
        Ok(())
    }

    /// Undo everything done since the last savepoint
    pub fn rollback_to_savepoint(&mut self) -> TxResult<()> {
        self.ensure_writable("roll back to a savepoint")?;
        let write = self.write_state_mut()?;
        let Some(savepoint) = write.savepoint.take() else {
            return Err(TxError::InvalidState {
                tx_id: self.id,
                state: self.state,
                operation: "roll back without a savepoint",
            });
        };

        write.dirty = savepoint.dirty;
        write.header = savepoint.header;
        write.header_dirty = savepoint.header_dirty;
        write.hooks.truncate(savepoint.hooks_len);
        write_arena_mut(write)?.truncate(savepoint.arena_used_pages);
        Ok(())
    }

    pub fn release_savepoint(&mut self) {
        if let Some(write) = self.write.as_mut() {
            write.savepoint = None;
        }
    }

    /// Commit the transaction, returning its id.
    ///
    /// A write transaction with no dirty pages commits without touching the
    /// journal and without consuming an id.
    pub fn commit(mut self) -> TxResult<TxId> {
        self.ensure_active("commit")?;
        self.transition(TxState::Committing)?;

        if self.write.is_none() {
            self.transition(TxState::Committed)?;
            return Ok(self.snapshot);
        }

        let entries = match self.stage_entries() {
            Ok(entries) => entries,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };

        if entries.is_empty() {
            self.transition(TxState::Committed)?;
            self.finish(TxOutcome {
                tx_id: self.id,
                committed: true,
            });
            return Ok(self.snapshot);
        }

        let record = JournalTransaction::new(self.id, entries);
        if let Err(e) = self.append(&record) {
            *self.env.failed.lock() = Some(e.to_string());
            log_event_with_fields(
                Event::JournalCorruption,
                &[("tx_id", &self.id.to_string()), ("error", &e.to_string())],
            );
            self.abort();
            return Err(e);
        }

        self.env.versions.write().publish(self.id, &record.pages);
        self.env.last_committed.store(self.id, Ordering::Release);
        self.transition(TxState::Committed)?;
        self.env.metrics.increment_commits();

        let tx_id = self.id;
        self.finish(TxOutcome {
            tx_id,
            committed: true,
        });
        self.env.committed();
        Ok(tx_id)
    }

    /// Discard the transaction
    pub fn rollback(mut self) {
        self.abort();
    }

    fn append(&self, record: &JournalTransaction) -> TxResult<()> {
        let mut journal = self.env.journal.lock();
        let before = journal.current_number();
        let bytes = journal.append(record)?;
        let metrics = &self.env.metrics;
        metrics.add_journal_bytes(bytes);
        match journal.sync_mode() {
            SyncMode::Immediate => metrics.increment_journal_syncs(),
            SyncMode::Deferred if journal.needs_sync() => {
                journal.sync()?;
                metrics.increment_journal_syncs();
            }
            SyncMode::Deferred => {}
        }
        if journal.current_number() != before {
            metrics.increment_journal_rotations();
        }
        Ok(())
    }

    /// Freeze dirty pages into journal entries, writing the header if needed
    fn stage_entries(&mut self) -> TxResult<Vec<PageEntry>> {
        let header_dirty = self.write_state_mut()?.header_dirty;
        if header_dirty {
            let header = self.write_state_mut()?.header;
            let page = self.cow_page(PageRef::single(HEADER_PAGE))?;
            header.write(page);
        }

        let write = self.write_state_mut()?;
        let arena = write_arena(write)?;
        write
            .dirty
            .values()
            .map(|dirty| {
                let bytes: Arc<[u8]> = Arc::from(arena.slice(dirty.slot)?);
                Ok(PageEntry::new(dirty.page_ref, bytes))
            })
            .collect()
    }

    fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TxState::RolledBack;
        if self.write.is_some() {
            self.env.metrics.increment_rollbacks();
            self.finish(TxOutcome {
                tx_id: self.id,
                committed: false,
            });
        }
    }

    /// Release the scratch arena and the writer slot, then run the hooks
    fn finish(&mut self, outcome: TxOutcome) {
        let Some(mut write) = self.write.take() else {
            return;
        };
        if let Some(arena) = write.arena.take() {
            self.env.scratch.release(arena);
        }
        self.env.writer_active.store(false, Ordering::Release);
        for hook in write.hooks.drain(..) {
            hook(outcome);
        }
    }

    fn transition(&mut self, next: TxState) -> TxResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TxError::InvalidState {
                tx_id: self.id,
                state: self.state,
                operation: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }

    fn ensure_active(&self, operation: &'static str) -> TxResult<()> {
        if self.state != TxState::Active {
            return Err(TxError::InvalidState {
                tx_id: self.id,
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> TxResult<()> {
        self.ensure_active(operation)?;
        if self.mode == TransactionMode::Read {
            return Err(TxError::ReadOnly(self.id));
        }
        Ok(())
    }

    fn write_state_mut(&mut self) -> TxResult<&mut WriteState> {
        let (id, state) = (self.id, self.state);
        self.write.as_mut().ok_or(TxError::InvalidState {
            tx_id: id,
            state,
            operation: "write",
        })
    }

    fn set_header(&mut self, header: FileHeader) -> TxResult<()> {
        let write = self.write_state_mut()?;
        if write.header != header {
            write.header = header;
            write.header_dirty = true;
        }
        Ok(())
    }

    /// Pages below `next_page_number`, never the header page
    fn check_bounds(&self, page_ref: PageRef) -> TxResult<()> {
        let next = self.header()?.next_page_number;
        if page_ref.number == HEADER_PAGE || page_ref.count == 0 || page_ref.end() > next {
            return Err(StorageError::out_of_bounds(page_ref.number, page_ref.count, next).into());
        }
        Ok(())
    }

    /// Pages freed by transactions below this id may be reused
    fn safe_before_tx(&self) -> TxId {
        let committed = self.env.last_committed.load(Ordering::Acquire);
        let oldest = self.env.readers.lock().oldest().unwrap_or(committed);
        oldest.min(committed) + 1
    }

    /// Zeroed staging slot for `page_ref`, replacing any earlier copy
    fn fresh_run(&mut self, page_ref: PageRef) -> TxResult<&mut [u8]> {
        let write = self.write_state_mut()?;
        let barrier = savepoint_barrier(write);
        let reusable = write
            .dirty
            .get(&page_ref.number)
            .filter(|d| d.page_ref == page_ref && d.slot.position >= barrier)
            .map(|d| d.slot);

        let slot = match reusable {
            Some(slot) => slot,
            None => {
                let slot = write_arena_mut(write)?.allocate(page_ref.count as usize)?;
                write.dirty.insert(page_ref.number, DirtyPage { page_ref, slot });
                slot
            }
        };
        let page = write_arena_mut(write)?.slice_mut(slot)?;
        page.fill(0);
        Ok(page)
    }
}

impl PageAccess for LowLevelTransaction {
    type Error = TxError;

    fn read_page(&self, page_number: PageNumber) -> TxResult<Vec<u8>> {
        Ok(self.get_page(PageRef::single(page_number))?.to_vec())
    }

    fn write_page(&mut self, page_number: PageNumber) -> TxResult<&mut [u8]> {
        self.page_mut(PageRef::single(page_number))
    }

    fn fresh_page(&mut self, page_ref: PageRef) -> TxResult<&mut [u8]> {
        self.fresh_run(page_ref)
    }
}

impl Drop for LowLevelTransaction {
    fn drop(&mut self) {
        match self.mode {
            TransactionMode::Read => self.env.readers.lock().unregister(self.snapshot),
            TransactionMode::ReadWrite => self.abort(),
        }
    }
}

impl std::fmt::Debug for LowLevelTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowLevelTransaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

fn write_arena(write: &WriteState) -> TxResult<&ScratchArena> {
    write
        .arena
        .as_ref()
        .ok_or_else(|| TxError::Concurrency("scratch arena already released".into()))
}

fn write_arena_mut(write: &mut WriteState) -> TxResult<&mut ScratchArena> {
    write
        .arena
        .as_mut()
        .ok_or_else(|| TxError::Concurrency("scratch arena already released".into()))
}

/// Slots below this arena position belong to the savepoint image
fn savepoint_barrier(write: &WriteState) -> usize {
    write.savepoint.as_ref().map_or(0, |s| s.arena_used_pages)
}

fn check_span(stored: PageRef, requested: PageRef) -> Result<(), StorageError> {
    if stored.count != requested.count {
        return Err(StorageError::invalid_page_ref(
            requested.number,
            format!(
                "requested {} pages, stored run has {}",
                requested.count, stored.count
            ),
        ));
    }
    Ok(())
}

/// Newest committed image of `page_ref` at `snapshot`
fn read_committed(env: &EnvInner, page_ref: PageRef, snapshot: TxId) -> TxResult<Vec<u8>> {
    if let Some((span, bytes)) = env.versions.read().get(page_ref.number, snapshot) {
        check_span(PageRef::overflow(page_ref.number, span), page_ref)?;
        return Ok(bytes.to_vec());
    }
    let bytes = env.pager.read().read_pages(page_ref)?;
    debug_assert_eq!(bytes.len(), page_ref.count as usize * PAGE_SIZE);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tx::StorageEnvironment;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StorageEnvironment {
        let mut config = EngineConfig::new(dir.path());
        config.initial_data_pages = 4;
        config.journal_file_size_bytes = 256 * 1024;
        config.flush.interval_ms = 60_000;
        StorageEnvironment::open(config).unwrap()
    }

    #[test]
    fn test_single_writer() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let tx = env.write_transaction().unwrap();
        assert!(matches!(env.write_transaction(), Err(TxError::WriterBusy)));
        drop(tx);
        assert!(env.write_transaction().is_ok());
    }

    #[test]
    fn test_read_transaction_is_read_only() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.read_transaction().unwrap();
        assert!(matches!(tx.allocate_page(1), Err(TxError::ReadOnly(_))));
        assert!(!tx.can_continue());
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        let page = tx.allocate_page(1).unwrap();
        tx.page_mut(page).unwrap()[PAGE_HEADER_SIZE] = 1;
        tx.commit().unwrap();

        let before = env.read_transaction().unwrap();

        let mut tx = env.write_transaction().unwrap();
        tx.page_mut(page).unwrap()[PAGE_HEADER_SIZE] = 2;
        assert_eq!(before.get_page(page).unwrap()[PAGE_HEADER_SIZE], 1);
        tx.commit().unwrap();

        let after = env.read_transaction().unwrap();
        assert_eq!(before.get_page(page).unwrap()[PAGE_HEADER_SIZE], 1);
        assert_eq!(after.get_page(page).unwrap()[PAGE_HEADER_SIZE], 2);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut tx = env.write_transaction().unwrap();
            tx.allocate_page(1).unwrap();
            ids.push(tx.commit().unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_commit_consumes_no_id() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let tx = env.write_transaction().unwrap();
        assert_eq!(tx.commit().unwrap(), 0);
        assert_eq!(env.last_committed(), 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        tx.allocate_page(1).unwrap();
        drop(tx);

        assert_eq!(env.last_committed(), 0);
        let reader = env.read_transaction().unwrap();
        assert_eq!(reader.header().unwrap().next_page_number, 1);
    }

    #[test]
    fn test_hooks_see_outcome() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let committed = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicUsize::new(0));

        let mut tx = env.write_transaction().unwrap();
        tx.allocate_page(1).unwrap();
        let c = Arc::clone(&committed);
        tx.on_dispose(move |outcome| {
            assert!(outcome.committed);
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tx.commit().unwrap();

        let mut tx = env.write_transaction().unwrap();
        let a = Arc::clone(&aborted);
        tx.on_dispose(move |outcome| {
            assert!(!outcome.committed);
            a.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tx.rollback();

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollback_to_savepoint() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        let kept = tx.allocate_page(1).unwrap();
        tx.page_mut(kept).unwrap()[PAGE_HEADER_SIZE] = 1;

        tx.savepoint().unwrap();
        tx.page_mut(kept).unwrap()[PAGE_HEADER_SIZE] = 9;
        let discarded = tx.allocate_page(1).unwrap();
        tx.on_dispose(|_| panic!("hook registered after the savepoint ran"))
            .unwrap();
        tx.rollback_to_savepoint().unwrap();

        assert_eq!(tx.get_page(kept).unwrap()[PAGE_HEADER_SIZE], 1);
        assert_eq!(tx.header().unwrap().next_page_number, discarded.number);
        tx.commit().unwrap();

        let reader = env.read_transaction().unwrap();
        assert_eq!(reader.get_page(kept).unwrap()[PAGE_HEADER_SIZE], 1);
        assert_eq!(reader.header().unwrap().next_page_number, discarded.number);
    }

    #[test]
    fn test_rollback_without_savepoint_fails() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        assert!(matches!(
            tx.rollback_to_savepoint(),
            Err(TxError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_freed_page_reused_only_after_readers_move_on() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        let a = tx.allocate_page(1).unwrap();
        let _b = tx.allocate_page(1).unwrap();
        tx.commit().unwrap();

        let reader = env.read_transaction().unwrap();
        let mut tx = env.write_transaction().unwrap();
        tx.free_page(a).unwrap();
        tx.commit().unwrap();

        let mut tx = env.write_transaction().unwrap();
        let next = tx.allocate_page(1).unwrap();
        assert_ne!(next.number, a.number);
        tx.rollback();

        drop(reader);
        let mut tx = env.write_transaction().unwrap();
        let reused = tx.allocate_page(1).unwrap();
        assert_eq!(reused.number, a.number);
    }

    #[test]
    fn test_overflow_page_header() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        let run = tx.allocate_page(3).unwrap();
        assert_eq!(run.count, 3);
        let header = PageHeader::read(&tx.get_page(run).unwrap()).unwrap();
        assert_eq!(header.flags, PageFlags::Overflow);
        assert_eq!(header.page_count(), 3);
        tx.commit().unwrap();

        let reader = env.read_transaction().unwrap();
        assert_eq!(reader.get_page(run).unwrap().len(), 3 * PAGE_SIZE);
        assert!(reader.get_page(PageRef::single(run.number)).is_err());
    }

    #[test]
    fn test_page_mut_rejects_header_and_unallocated_pages() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        assert!(tx.page_mut(PageRef::single(HEADER_PAGE)).is_err());
        assert!(tx.page_mut(PageRef::single(5)).is_err());
    }

    #[test]
    fn test_bad_page_refs_are_not_fatal() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);

        let mut tx = env.write_transaction().unwrap();
        let run = tx.allocate_page(2).unwrap();
        let single = tx.allocate_page(1).unwrap();

        let err = tx.page_mut(PageRef::single(run.number)).unwrap_err();
        assert!(!err.is_fatal());

        tx.free_page(single).unwrap();
        let err = tx.free_page(single).unwrap_err();
        assert!(!err.is_fatal());

        // The transaction is still usable.
        tx.page_mut(run).unwrap()[PAGE_HEADER_SIZE] = 1;
        assert_eq!(tx.commit().unwrap(), 1);
    }

    #[test]
    fn test_can_continue_respects_size_limit() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.max_transaction_size_bytes = 2 * PAGE_SIZE as u64;
        config.flush.interval_ms = 60_000;
        let env = StorageEnvironment::open(config).unwrap();

        let mut tx = env.write_transaction().unwrap();
        assert!(tx.can_continue());
        tx.allocate_page(1).unwrap();
        tx.allocate_page(1).unwrap();
        assert!(!tx.can_continue());
    }
}
