//! Bulk insert
//!
//! Producers stage operations in a [`BulkInsertBatcher`], which hands them to
//! the merger as one [`BulkInsertCommand`] per ~16 MiB of staged data. The
//! producer only waits for the merger when a batch is flushed, so network
//! reads and the writer thread overlap.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::rate_limit::OperationCancelToken;

use super::command::{MergedCommand, ReplayableCommandDto};
use super::context::TransactionContext;
use super::errors::{CommandError, MergerError};
use super::recording::CommandRegistry;
use super::retry::IdRetryPolicy;
use super::scheduler::TransactionOperationsMerger;

pub const BULK_INSERT_KIND: &str = "bulk_insert";

/// Staged bytes after which the batcher enqueues a command
pub const DEFAULT_FLUSH_THRESHOLD_BYTES: u64 = 16 * 1024 * 1024;

/// One write applied by a bulk insert
pub trait BulkOperation: Serialize + DeserializeOwned + Send + 'static {
    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    /// Approximate bytes written by `apply`
    fn size(&self) -> u64;

    fn apply(&self, ctx: &mut TransactionContext<'_>) -> Result<(), CommandError>;
}

#[derive(Deserialize)]
#[serde(bound = "O: BulkOperation")]
struct BulkInsertPayload<O> {
    operations: Vec<O>,
}

pub struct BulkInsertCommand<O> {
    operations: Vec<O>,
    /// Index of the operation that hit a conflict in the last run
    conflicted_at: Option<usize>,
}

impl<O: BulkOperation> BulkInsertCommand<O> {
    pub fn new(operations: Vec<O>) -> Self {
        Self {
            operations,
            conflicted_at: None,
        }
    }

    pub fn operations(&self) -> &[O] {
        &self.operations
    }

    /// Make bulk insert commands of this operation type replayable
    pub fn register(registry: &mut CommandRegistry) {
        registry.register(BULK_INSERT_KIND, |payload| {
            let payload: BulkInsertPayload<O> = serde_json::from_value(payload.clone())
                .map_err(|e| CommandError::Failed(format!("bad bulk insert payload: {e}")))?;
            Ok(Box::new(BulkInsertCommand::new(payload.operations)) as Box<dyn MergedCommand>)
        });
    }
}

impl<O: BulkOperation> MergedCommand for BulkInsertCommand<O> {
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        self.conflicted_at = None;
        for (index, operation) in self.operations.iter().enumerate() {
            match operation.apply(ctx) {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    self.conflicted_at = Some(index);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.operations.len() as u64)
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        let operations = serde_json::to_value(&self.operations)
            .map_err(|e| CommandError::Failed(format!("failed to serialize bulk insert: {e}")))?;
        let mut payload = serde_json::Map::new();
        payload.insert("operations".to_string(), operations);
        Ok(ReplayableCommandDto::new(
            BULK_INSERT_KIND,
            serde_json::Value::Object(payload),
        ))
    }

    fn estimate_size(&self) -> u64 {
        self.operations.iter().map(BulkOperation::size).sum()
    }

    fn kind(&self) -> &str {
        BULK_INSERT_KIND
    }

    /// Only a conflict on a store-generated id is retried. That id and every
    /// later store-generated id in the batch get a fresh value.
    fn prepare_retry(&mut self, policy: &dyn IdRetryPolicy) -> bool {
        let Some(index) = self.conflicted_at.take() else {
            return false;
        };
        if !policy.qualifies(self.operations[index].id()) {
            return false;
        }
        for operation in &mut self.operations[index..] {
            if policy.qualifies(operation.id()) {
                let id = policy.rewrite(operation.id());
                operation.set_id(id);
            }
        }
        true
    }

    /// Nothing ran yet, so every store-generated id gets a fresh value.
    fn prepare_dependent_retry(&mut self, policy: &dyn IdRetryPolicy) -> bool {
        let mut rewritten = false;
        for operation in &mut self.operations {
            if policy.qualifies(operation.id()) {
                let id = policy.rewrite(operation.id());
                operation.set_id(id);
                rewritten = true;
            }
        }
        rewritten
    }
}

/// Progress of a bulk insert, updated after every committed batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkInsertProgress {
    pub batch_count: u64,
    pub processed: u64,
    pub last_processed_id: Option<String>,
}

pub struct BulkInsertBatcher<O> {
    merger: Arc<TransactionOperationsMerger>,
    token: OperationCancelToken,
    flush_threshold_bytes: u64,
    staged: Vec<O>,
    staged_bytes: u64,
    progress: BulkInsertProgress,
}

impl<O: BulkOperation> BulkInsertBatcher<O> {
    pub fn new(merger: Arc<TransactionOperationsMerger>, token: OperationCancelToken) -> Self {
        Self {
            merger,
            token,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
            staged: Vec::new(),
            staged_bytes: 0,
            progress: BulkInsertProgress::default(),
        }
    }

    pub fn with_flush_threshold(mut self, bytes: u64) -> Self {
        self.flush_threshold_bytes = bytes.max(1);
        self
    }

    /// Stage one operation, flushing when the staged size crosses the threshold
    pub async fn add(&mut self, operation: O) -> Result<(), MergerError> {
        self.token.check()?;
        self.token.delay();

        self.staged_bytes += operation.size();
        self.staged.push(operation);
        if self.staged_bytes >= self.flush_threshold_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    /// Enqueue the staged operations and wait for their commit
    pub async fn flush(&mut self) -> Result<(), MergerError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let operations = std::mem::take(&mut self.staged);
        self.staged_bytes = 0;
        let last_id = operations.last().map(|o| o.id().to_string());

        let processed = self
            .merger
            .enqueue(Box::new(BulkInsertCommand::new(operations)))
            .await?;

        self.progress.batch_count += 1;
        self.progress.processed += processed;
        self.progress.last_processed_id = last_id;
        Ok(())
    }

    /// Flush what is left and return the final progress
    pub async fn finish(mut self) -> Result<BulkInsertProgress, MergerError> {
        self.token.check()?;
        self.flush().await?;
        Ok(self.progress)
    }

    pub fn progress(&self) -> &BulkInsertProgress {
        &self.progress
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}
