//! Merger tests: batching order, conflict retry, failure isolation and
//! command recording.

use std::sync::Arc;
use std::time::Duration;

use aerostore::config::EngineConfig;
use aerostore::merger::{
    BulkInsertCommand, BulkOperation, CachedProperties, CommandError, CommandRecorder,
    CommandRegistry, MergedCommand, MergerConfig, MergerError, ReplayableCommandDto,
    TransactionContext, TransactionOperationsMerger,
};
use aerostore::storage::{PageRef, PAGE_HEADER_SIZE};
use aerostore::tx::StorageEnvironment;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

fn open(dir: &TempDir) -> StorageEnvironment {
    let mut config = EngineConfig::new(dir.path().join("store"));
    config.initial_data_pages = 16;
    config.journal_file_size_bytes = 1024 * 1024;
    config.flush.interval_ms = 60_000;
    StorageEnvironment::open(config).unwrap()
}

fn start(env: &StorageEnvironment) -> Arc<TransactionOperationsMerger> {
    Arc::new(TransactionOperationsMerger::start(env.clone(), MergerConfig::default()).unwrap())
}

type Written = Arc<Mutex<Vec<(u64, u8)>>>;

/// Writes `fill` into a fresh page and reports the page once committed
struct WriteFill {
    fill: u8,
    written: Written,
}

impl WriteFill {
    fn boxed(fill: u8, written: &Written) -> Box<dyn MergedCommand> {
        Box::new(Self {
            fill,
            written: Arc::clone(written),
        })
    }
}

impl MergedCommand for WriteFill {
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        let tx = ctx.transaction();
        let page = tx.allocate_page(1)?;
        tx.page_mut(page)?[PAGE_HEADER_SIZE] = self.fill;

        let written = Arc::clone(&self.written);
        let fill = self.fill;
        ctx.on_dispose(move |outcome| {
            if outcome.committed {
                written.lock().push((page.number, fill));
            }
        })?;
        Ok(1)
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        Ok(ReplayableCommandDto::new(
            "write_fill",
            serde_json::json!({ "fill": self.fill }),
        ))
    }

    fn kind(&self) -> &str {
        "write_fill"
    }
}

struct Fail;

impl MergedCommand for Fail {
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        // Staged work must not leak into the batch.
        ctx.transaction().allocate_page(1)?;
        Err(CommandError::Failed("rejected by validation".into()))
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        Ok(ReplayableCommandDto::new("fail", serde_json::Value::Null))
    }

    fn kind(&self) -> &str {
        "fail"
    }
}

/// Frees the same fresh page twice
struct DoubleFree;

impl MergedCommand for DoubleFree {
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        let tx = ctx.transaction();
        let page = tx.allocate_page(1)?;
        tx.free_page(page)?;
        tx.free_page(page)?;
        Ok(1)
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        Ok(ReplayableCommandDto::new("double_free", serde_json::Value::Null))
    }

    fn kind(&self) -> &str {
        "double_free"
    }
}

struct Sleep(Duration);

impl MergedCommand for Sleep {
    fn execute(&mut self, _ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        std::thread::sleep(self.0);
        Ok(0)
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        Ok(ReplayableCommandDto::new("sleep", serde_json::Value::Null))
    }

    fn kind(&self) -> &str {
        "sleep"
    }
}

/// Document with an id; an id ending in the separator collides on first use
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Doc {
    id: String,
}

impl BulkOperation for Doc {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn size(&self) -> u64 {
        self.id.len() as u64
    }

    fn apply(&self, ctx: &mut TransactionContext<'_>) -> Result<(), CommandError> {
        if self.id.ends_with('/') {
            return Err(CommandError::Concurrency(format!(
                "identity {} already taken",
                self.id
            )));
        }
        let tx = ctx.transaction();
        let page = tx.allocate_page(1)?;
        let bytes = tx.page_mut(page)?;
        let id = self.id.as_bytes();
        bytes[PAGE_HEADER_SIZE] = id.len() as u8;
        bytes[PAGE_HEADER_SIZE + 1..PAGE_HEADER_SIZE + 1 + id.len()].copy_from_slice(id);
        Ok(())
    }
}

fn bulk(id: &str) -> Box<dyn MergedCommand> {
    Box::new(BulkInsertCommand::new(vec![Doc { id: id.to_string() }]))
}

/// Keep the writer busy so the next commands queue up into one batch
async fn hold_writer(
    merger: &Arc<TransactionOperationsMerger>,
) -> tokio::task::JoinHandle<Result<u64, MergerError>> {
    let merger = Arc::clone(merger);
    let busy = tokio::spawn(async move {
        merger
            .enqueue(Box::new(Sleep(Duration::from_millis(150))))
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    busy
}

/// Ids stored in every allocated page, in page order
fn stored_ids(env: &StorageEnvironment) -> Vec<String> {
    let tx = env.read_transaction().unwrap();
    let next = tx.header().unwrap().next_page_number;
    (1..next)
        .map(|number| {
            let page = tx.get_page(PageRef::single(number)).unwrap();
            let len = page[PAGE_HEADER_SIZE] as usize;
            String::from_utf8(page[PAGE_HEADER_SIZE + 1..PAGE_HEADER_SIZE + 1 + len].to_vec())
                .unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_commands_commit_in_fifo_order() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);
    let written: Written = Arc::new(Mutex::new(Vec::new()));

    let (a, b, c, d) = tokio::join!(
        merger.enqueue(WriteFill::boxed(1, &written)),
        merger.enqueue(WriteFill::boxed(2, &written)),
        merger.enqueue(WriteFill::boxed(3, &written)),
        merger.enqueue(WriteFill::boxed(4, &written)),
    );
    for result in [a, b, c, d] {
        assert_eq!(result.unwrap(), 1);
    }
    merger.shutdown().await;

    let mut written = written.lock().clone();
    written.sort();
    let fills: Vec<u8> = written.iter().map(|(_, fill)| *fill).collect();
    assert_eq!(fills, vec![1, 2, 3, 4]);
    assert_eq!(env.metrics().snapshot().commands_executed, 4);
}

#[tokio::test]
async fn test_conflict_retries_only_the_conflicting_command() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);

    let results = tokio::join!(
        merger.enqueue(bulk("orders/1")),
        merger.enqueue(bulk("users/")),
        merger.enqueue(bulk("orders/2")),
        merger.enqueue(bulk("orders/3")),
        merger.enqueue(bulk("orders/4")),
    );
    assert_eq!(results.0.unwrap(), 1);
    assert_eq!(results.1.unwrap(), 1);
    assert_eq!(results.2.unwrap(), 1);
    assert_eq!(results.3.unwrap(), 1);
    assert_eq!(results.4.unwrap(), 1);
    merger.shutdown().await;

    let ids = stored_ids(&env);
    assert_eq!(ids.len(), 5);
    for clean in ["orders/1", "orders/2", "orders/3", "orders/4"] {
        assert_eq!(ids.iter().filter(|id| id.as_str() == clean).count(), 1);
    }
    let users: Vec<&String> = ids.iter().filter(|id| id.starts_with("users/")).collect();
    assert_eq!(users.len(), 1);
    assert!(users[0].len() > "users/".len());

    let metrics = env.metrics().snapshot();
    assert_eq!(metrics.commands_retried, 1);
    assert_eq!(metrics.commands_failed, 0);
}

#[tokio::test]
async fn test_conflict_keeps_commit_order() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);

    let busy = hold_writer(&merger).await;
    let (first, second) = tokio::join!(
        merger.enqueue(bulk("users/")),
        merger.enqueue(bulk("orders/1")),
    );
    busy.await.unwrap().unwrap();
    assert_eq!(first.unwrap(), 1);
    assert_eq!(second.unwrap(), 1);
    merger.shutdown().await;

    // Pages are handed out in commit order.
    let ids = stored_ids(&env);
    assert_eq!(ids.len(), 2);
    assert!(ids[0].starts_with("users/") && ids[0].len() > "users/".len());
    assert_eq!(ids[1], "orders/1");
}

#[tokio::test]
async fn test_pending_same_kind_commands_are_rewritten_with_the_conflict() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);

    let busy = hold_writer(&merger).await;
    let (first, second) = tokio::join!(
        merger.enqueue(bulk("users/")),
        merger.enqueue(bulk("users/")),
    );
    busy.await.unwrap().unwrap();
    assert_eq!(first.unwrap(), 1);
    assert_eq!(second.unwrap(), 1);
    merger.shutdown().await;

    let ids = stored_ids(&env);
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert!(ids.iter().all(|id| id.starts_with("users/") && id.len() > "users/".len()));

    let metrics = env.metrics().snapshot();
    assert_eq!(metrics.commands_retried, 1);
    assert_eq!(metrics.commands_failed, 0);
}

#[tokio::test]
async fn test_failing_command_does_not_poison_batch() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);
    let written: Written = Arc::new(Mutex::new(Vec::new()));

    let (first, failed, second) = tokio::join!(
        merger.enqueue(WriteFill::boxed(1, &written)),
        merger.enqueue(Box::new(Fail)),
        merger.enqueue(WriteFill::boxed(2, &written)),
    );
    assert_eq!(first.unwrap(), 1);
    assert_eq!(second.unwrap(), 1);
    assert!(matches!(
        failed,
        Err(MergerError::Command(CommandError::Failed(_)))
    ));
    merger.shutdown().await;

    // The failed command's page was rolled back with its savepoint.
    let tx = env.read_transaction().unwrap();
    assert_eq!(tx.header().unwrap().next_page_number, 3);
    assert_eq!(written.lock().len(), 2);
}

#[tokio::test]
async fn test_invalid_page_use_fails_only_that_command() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);
    let written: Written = Arc::new(Mutex::new(Vec::new()));

    let (first, bad, second) = tokio::join!(
        merger.enqueue(WriteFill::boxed(1, &written)),
        merger.enqueue(Box::new(DoubleFree)),
        merger.enqueue(WriteFill::boxed(2, &written)),
    );
    assert_eq!(first.unwrap(), 1);
    assert_eq!(second.unwrap(), 1);
    assert!(matches!(
        bad,
        Err(MergerError::Command(CommandError::Transaction(_)))
    ));
    merger.shutdown().await;

    assert_eq!(written.lock().len(), 2);
    assert_eq!(env.metrics().snapshot().batches_failed, 0);
}

#[tokio::test]
async fn test_enqueue_timeout_is_distinct() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);

    let result = merger
        .enqueue_with_timeout(
            Box::new(Sleep(Duration::from_millis(300))),
            Duration::from_millis(10),
        )
        .await;
    let err = result.unwrap_err();
    assert!(err.is_timeout());
    assert!(!err.is_cancelled());
    merger.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_after_shutdown_fails() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);
    merger.shutdown().await;

    let written: Written = Arc::new(Mutex::new(Vec::new()));
    let result = merger.enqueue(WriteFill::boxed(1, &written)).await;
    assert!(matches!(result, Err(MergerError::Shutdown)));
}

#[tokio::test]
async fn test_recorded_batches_replay_onto_fresh_store() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let recording = dir.path().join("commands.jsonl");
    let config = MergerConfig::default().with_recorder(CommandRecorder::create(&recording).unwrap());
    let merger = TransactionOperationsMerger::start(env.clone(), config).unwrap();
    let written: Written = Arc::new(Mutex::new(Vec::new()));

    merger.enqueue(WriteFill::boxed(7, &written)).await.unwrap();
    assert!(merger.enqueue(Box::new(Fail)).await.is_err());
    merger.enqueue(WriteFill::boxed(8, &written)).await.unwrap();
    merger.shutdown().await;

    let replay_written: Written = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CommandRegistry::new();
    let sink = Arc::clone(&replay_written);
    registry.register("write_fill", move |payload| {
        let fill = payload["fill"]
            .as_u64()
            .ok_or_else(|| CommandError::Failed("missing fill".into()))?;
        Ok(WriteFill::boxed(fill as u8, &sink))
    });

    let batches = registry.replay(&recording).unwrap();
    let commands: Vec<Box<dyn MergedCommand>> =
        batches.into_iter().flat_map(|batch| batch.commands).collect();
    assert_eq!(commands.len(), 2);

    let other = TempDir::new().unwrap();
    let fresh = open(&other);
    let mut tx = fresh.write_transaction().unwrap();
    let mut cached = CachedProperties::new();
    for mut command in commands {
        command
            .execute(&mut TransactionContext::new(&mut tx, &mut cached))
            .unwrap();
    }
    tx.commit().unwrap();

    let mut original = written.lock().clone();
    let mut replayed = replay_written.lock().clone();
    original.sort();
    replayed.sort();
    assert_eq!(original, replayed);
}

#[test]
fn test_blocking_enqueue_from_plain_threads() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = start(&env);
    let written: Written = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4u8)
        .map(|fill| {
            let merger = Arc::clone(&merger);
            let written = Arc::clone(&written);
            std::thread::spawn(move || merger.enqueue_blocking(WriteFill::boxed(fill, &written)))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 1);
    }
    merger.shutdown_blocking();

    let mut pages: Vec<u64> = written.lock().iter().map(|(page, _)| *page).collect();
    pages.sort();
    pages.dedup();
    assert_eq!(pages, vec![1, 2, 3, 4]);
}
