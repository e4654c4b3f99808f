//! Rate-limited driver tests through the merger

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use aerostore::config::EngineConfig;
use aerostore::merger::{
    CachedProperties, CommandError, MergedCommand, MergerConfig, ReplayableCommandDto,
    TransactionContext, TransactionOperationsMerger,
};
use aerostore::rate_limit::{
    ExecuteRateLimitedOperations, OperationCancelToken, RateGate, SharedQueue,
};
use aerostore::storage::PAGE_HEADER_SIZE;
use aerostore::tx::StorageEnvironment;
use parking_lot::Mutex;
use tempfile::TempDir;

fn open(dir: &TempDir) -> StorageEnvironment {
    let mut config = EngineConfig::new(dir.path());
    config.initial_data_pages = 64;
    config.journal_file_size_bytes = 4 * 1024 * 1024;
    config.flush.interval_ms = 60_000;
    StorageEnvironment::open(config).unwrap()
}

/// Writes one item into a fresh page
struct Touch(u32);

impl MergedCommand for Touch {
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        let tx = ctx.transaction();
        let page = tx.allocate_page(1)?;
        tx.page_mut(page)?[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4]
            .copy_from_slice(&self.0.to_le_bytes());
        Ok(1)
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        Ok(ReplayableCommandDto::new("touch", serde_json::json!(self.0)))
    }

    fn kind(&self) -> &str {
        "touch"
    }
}

fn queue(n: u32) -> SharedQueue<u32> {
    Arc::new(Mutex::new((0..n).collect::<VecDeque<_>>()))
}

fn driver(
    items: &SharedQueue<u32>,
    gate: &Arc<RateGate>,
    token: OperationCancelToken,
) -> ExecuteRateLimitedOperations<u32> {
    ExecuteRateLimitedOperations::new(
        Arc::clone(items),
        |item: &u32| Some(Box::new(Touch(*item)) as Box<dyn MergedCommand>),
        Some(Arc::clone(gate)),
        token,
        None,
    )
}

#[tokio::test]
async fn test_gate_limits_one_batch_and_reports_wait() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = TransactionOperationsMerger::start(env.clone(), MergerConfig::default()).unwrap();
    let items = queue(25);
    let gate = Arc::new(RateGate::manual(10));

    let command = driver(&items, &gate, OperationCancelToken::none());
    let stats = command.stats();
    assert_eq!(merger.enqueue(Box::new(command)).await.unwrap(), 10);
    assert!(stats.needs_wait());
    assert_eq!(items.lock().len(), 15);
    assert_eq!(items.lock().front(), Some(&10));

    // No tokens left: the next batch processes nothing and leaves the queue.
    let command = driver(&items, &gate, OperationCancelToken::none());
    let stats = command.stats();
    assert_eq!(merger.enqueue(Box::new(command)).await.unwrap(), 0);
    assert!(stats.needs_wait());
    assert_eq!(items.lock().len(), 15);

    gate.refill();
    let command = driver(&items, &gate, OperationCancelToken::none());
    assert_eq!(merger.enqueue(Box::new(command)).await.unwrap(), 10);
    assert_eq!(items.lock().len(), 5);
    merger.shutdown().await;

    let tx = env.read_transaction().unwrap();
    assert_eq!(tx.header().unwrap().next_page_number, 21);
}

#[test]
fn test_items_leave_queue_only_on_commit() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let items = queue(25);
    let gate = Arc::new(RateGate::manual(10));
    let mut command = driver(&items, &gate, OperationCancelToken::none());

    let mut tx = env.write_transaction().unwrap();
    let mut cached = CachedProperties::new();
    let processed = command
        .execute(&mut TransactionContext::new(&mut tx, &mut cached))
        .unwrap();
    assert_eq!(processed, 10);
    assert_eq!(items.lock().len(), 25);
    tx.rollback();
    assert_eq!(items.lock().len(), 25);

    gate.refill();
    let mut tx = env.write_transaction().unwrap();
    command
        .execute(&mut TransactionContext::new(&mut tx, &mut cached))
        .unwrap();
    assert_eq!(items.lock().len(), 25);
    tx.commit().unwrap();
    assert_eq!(items.lock().len(), 15);
}

#[tokio::test]
async fn test_cancelled_driver_resolves_cancelled() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = TransactionOperationsMerger::start(env.clone(), MergerConfig::default()).unwrap();
    let items = queue(5);
    let gate = Arc::new(RateGate::manual(10));
    let token = OperationCancelToken::none();
    token.cancel();

    let err = merger
        .enqueue(Box::new(driver(&items, &gate, token)))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(items.lock().len(), 5);
    merger.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_resolves_timeout() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = TransactionOperationsMerger::start(env.clone(), MergerConfig::default()).unwrap();
    let items = queue(5);
    let gate = Arc::new(RateGate::manual(10));
    let token = OperationCancelToken::new(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = merger
        .enqueue(Box::new(driver(&items, &gate, token)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(!err.is_cancelled());
    assert_eq!(items.lock().len(), 5);
    merger.shutdown().await;
}

#[tokio::test]
async fn test_timed_gate_drains_queue_over_several_batches() {
    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    let merger = TransactionOperationsMerger::start(env.clone(), MergerConfig::default()).unwrap();
    let items = queue(25);
    let gate = Arc::new(RateGate::new(10, Duration::from_millis(20)).unwrap());

    let mut total = 0;
    for _ in 0..200 {
        let command = driver(&items, &gate, OperationCancelToken::new(Duration::from_secs(5)));
        let stats = command.stats();
        total += merger.enqueue(Box::new(command)).await.unwrap();
        if items.lock().is_empty() {
            break;
        }
        if stats.needs_wait() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    merger.shutdown().await;

    assert_eq!(total, 25);
    assert!(items.lock().is_empty());
}
