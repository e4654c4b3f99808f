//! The single-writer loop
//!
//! Commands arrive over a bounded channel and are executed on one dedicated
//! thread. Each physical transaction takes commands in FIFO order, runs each
//! inside its own savepoint and resolves callers only after the commit.
//! A conflict ends the command loop early: the commands before it commit,
//! and it runs again at the head of the next transaction with everything
//! queued behind it.
//!
//! ```text
//!   enqueue() ──► [ bounded channel ] ──► writer thread
//!                                          │ open write tx
//!                                          │ for each command: savepoint, execute
//!                                          │ commit
//!                                          ▼
//!                                 resolve every command's reply
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::config::MergerSettings;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::tx::{LowLevelTransaction, StorageEnvironment, TxError, TxId};

use super::command::MergedCommand;
use super::context::{CachedProperties, TransactionContext};
use super::errors::{CommandError, MergerError};
use super::recording::{CommandRecorder, RecordingError};
use super::retry::{IdRetryPolicy, SuffixSeparatorPolicy};

type Reply = oneshot::Sender<Result<u64, MergerError>>;

pub struct MergerConfig {
    pub queue_capacity: usize,
    pub max_batch_items: usize,
    pub max_batch_bytes: u64,
    pub max_conflict_retries: u32,
    pub retry_policy: Arc<dyn IdRetryPolicy>,
    pub recorder: Option<CommandRecorder>,
}

impl MergerConfig {
    pub fn from_settings(settings: &MergerSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            max_batch_items: settings.max_batch_items,
            max_batch_bytes: settings.max_batch_bytes,
            max_conflict_retries: settings.max_conflict_retries,
            retry_policy: Arc::new(SuffixSeparatorPolicy::default()),
            recorder: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn IdRetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_recorder(mut self, recorder: CommandRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self::from_settings(&MergerSettings::default())
    }
}

struct Pending {
    command: Box<dyn MergedCommand>,
    reply: Reply,
    retries: u32,
    size: u64,
}

impl Pending {
    fn resolve(self, result: Result<u64, MergerError>) {
        // The caller may have given up waiting.
        let _ = self.reply.send(result);
    }
}

enum Message {
    Command(Pending),
    Stop,
}

pub struct TransactionOperationsMerger {
    sender: mpsc::Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionOperationsMerger {
    /// Spawn the writer thread over `env`
    pub fn start(env: StorageEnvironment, config: MergerConfig) -> Result<Self, MergerError> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let worker = thread::Builder::new()
            .name("aerostore-merger".to_string())
            .spawn(move || Worker::new(env, config, receiver).run())
            .map_err(MergerError::Start)?;

        Ok(Self {
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Submit a command; resolves after its transaction committed or failed
    pub async fn enqueue(&self, command: Box<dyn MergedCommand>) -> Result<u64, MergerError> {
        let (pending, reply) = Self::pending(command);
        self.sender
            .send(Message::Command(pending))
            .await
            .map_err(|_| MergerError::Shutdown)?;
        reply.await.map_err(|_| MergerError::Shutdown)?
    }

    /// `enqueue` bounded by `timeout`; expiry is reported as `Timeout`.
    ///
    /// The command may still be executed after the timeout fired.
    pub async fn enqueue_with_timeout(
        &self,
        command: Box<dyn MergedCommand>,
        timeout: Duration,
    ) -> Result<u64, MergerError> {
        tokio::time::timeout(timeout, self.enqueue(command))
            .await
            .map_err(|_| MergerError::Timeout(timeout))?
    }

    /// Blocking `enqueue` for threads outside an async runtime
    pub fn enqueue_blocking(&self, command: Box<dyn MergedCommand>) -> Result<u64, MergerError> {
        let (pending, reply) = Self::pending(command);
        self.sender
            .blocking_send(Message::Command(pending))
            .map_err(|_| MergerError::Shutdown)?;
        reply.blocking_recv().map_err(|_| MergerError::Shutdown)?
    }

    /// Stop accepting commands, finish the queued ones and join the thread
    pub async fn shutdown(&self) {
        let _ = self.sender.send(Message::Stop).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
    }

    /// Blocking `shutdown`
    pub fn shutdown_blocking(&self) {
        let _ = self.sender.blocking_send(Message::Stop);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    fn pending(command: Box<dyn MergedCommand>) -> (Pending, oneshot::Receiver<Result<u64, MergerError>>) {
        let (reply, receiver) = oneshot::channel();
        let size = command.estimate_size();
        (
            Pending {
                command,
                reply,
                retries: 0,
                size,
            },
            receiver,
        )
    }
}

/// What ended the command loop of one transaction
enum BatchEnd {
    Done,
    Fatal(TxError),
}

struct Worker {
    env: StorageEnvironment,
    config: MergerConfig,
    receiver: mpsc::Receiver<Message>,
    metrics: Arc<MetricsRegistry>,
    cached: CachedProperties,
    /// Commands to run before anything new from the channel
    backlog: VecDeque<Pending>,
    stopping: bool,
}

impl Worker {
    fn new(env: StorageEnvironment, config: MergerConfig, receiver: mpsc::Receiver<Message>) -> Self {
        let metrics = env.metrics();
        Self {
            env,
            config,
            receiver,
            metrics,
            cached: CachedProperties::new(),
            backlog: VecDeque::new(),
            stopping: false,
        }
    }

    fn run(mut self) {
        Logger::info(
            Event::MergerStarted.as_str(),
            &[("max_batch_items", &self.config.max_batch_items.to_string())],
        );

        loop {
            let mut batch = std::mem::take(&mut self.backlog);
            if batch.is_empty() {
                match self.next_blocking() {
                    Some(pending) => batch.push_back(pending),
                    None => break,
                }
            }
            while batch.len() < self.config.max_batch_items {
                match self.next_ready() {
                    Some(pending) => batch.push_back(pending),
                    None => break,
                }
            }
            self.run_batch(batch);
        }

        Logger::info(Event::MergerStopped.as_str(), &[]);
    }

    /// Wait for the next command; the only blocking point of the loop
    fn next_blocking(&mut self) -> Option<Pending> {
        loop {
            let message = if self.stopping {
                self.receiver.try_recv().ok()
            } else {
                self.receiver.blocking_recv()
            };
            match message? {
                Message::Command(pending) => return Some(pending),
                Message::Stop => self.stop(),
            }
        }
    }

    fn next_ready(&mut self) -> Option<Pending> {
        loop {
            match self.receiver.try_recv().ok()? {
                Message::Command(pending) => return Some(pending),
                Message::Stop => self.stop(),
            }
        }
    }

    fn stop(&mut self) {
        self.stopping = true;
        self.receiver.close();
    }

    fn run_batch(&mut self, mut batch: VecDeque<Pending>) {
        let mut tx = match self.env.write_transaction() {
            Ok(tx) => tx,
            Err(e) => {
                let error = Arc::new(e);
                for pending in batch {
                    pending.resolve(Err(MergerError::Transaction(Arc::clone(&error))));
                }
                return;
            }
        };
        let tx_id = tx.id();
        self.cached.clear_renew();

        let mut executed: Vec<(Pending, u64)> = Vec::new();
        self.record(|r| r.begin_batch(tx_id));

        let end = self.execute_commands(&mut tx, &mut batch, &mut executed);

        // Commands not reached, a conflicting one first, keep their FIFO
        // place ahead of anything newer.
        self.backlog.extend(batch);

        match end {
            BatchEnd::Done => self.commit(tx, tx_id, executed),
            BatchEnd::Fatal(error) => {
                tx.rollback();
                self.fail_batch(tx_id, executed, error);
            }
        }
        self.cached.clear_renew();
    }

    fn execute_commands(
        &mut self,
        tx: &mut LowLevelTransaction,
        batch: &mut VecDeque<Pending>,
        executed: &mut Vec<(Pending, u64)>,
    ) -> BatchEnd {
        let mut batch_bytes = 0u64;
        let mut index = 0usize;

        while let Some(mut pending) = batch.pop_front() {
            let position = index;
            index += 1;

            if self.config.recorder.is_some() {
                match pending.command.to_dto() {
                    Ok(dto) => self.record(|r| r.record(position, dto)),
                    Err(e) => {
                        Logger::warn(
                            Event::CommandRejected.as_str(),
                            &[("kind", pending.command.kind()), ("error", &e.to_string())],
                        );
                        self.metrics.increment_commands_failed();
                        pending.resolve(Err(e.into()));
                        continue;
                    }
                }
            }

            if let Err(e) = tx.savepoint() {
                batch.push_front(pending);
                return BatchEnd::Fatal(e);
            }
            let result = {
                let mut ctx = TransactionContext::new(tx, &mut self.cached);
                pending.command.execute(&mut ctx)
            };

            match result {
                Ok(count) => {
                    tx.release_savepoint();
                    batch_bytes += pending.size;
                    executed.push((pending, count));
                }
                Err(CommandError::Transaction(e)) if e.is_fatal() => {
                    executed.push((pending, 0));
                    return BatchEnd::Fatal(e);
                }
                Err(e) => {
                    if let Err(fatal) = tx.rollback_to_savepoint() {
                        executed.push((pending, 0));
                        return BatchEnd::Fatal(fatal);
                    }
                    self.record(|r| r.abort(position));
                    if e.is_recoverable() {
                        if self.handle_conflict(pending, e, batch) {
                            // Later commands must not commit ahead of the retry.
                            break;
                        }
                    } else {
                        self.metrics.increment_commands_failed();
                        pending.resolve(Err(e.into()));
                    }
                }
            }

            if executed.len() >= self.config.max_batch_items
                || batch_bytes >= self.config.max_batch_bytes
                || !tx.can_continue()
            {
                break;
            }
        }
        BatchEnd::Done
    }

    /// Put the conflicting command back at the head of `batch` for the
    /// next transaction, and rewrite identities of pending same-kind
    /// commands so they do not hit the same conflict. Returns false when the
    /// command was failed instead.
    fn handle_conflict(
        &mut self,
        mut pending: Pending,
        error: CommandError,
        batch: &mut VecDeque<Pending>,
    ) -> bool {
        let policy = Arc::clone(&self.config.retry_policy);
        let kind = pending.command.kind().to_string();

        if pending.retries >= self.config.max_conflict_retries
            || !pending.command.prepare_retry(policy.as_ref())
        {
            self.metrics.increment_commands_failed();
            pending.resolve(Err(error.into()));
            return false;
        }

        pending.retries += 1;
        self.note_retry(&kind, pending.retries, &error);

        for other in batch.iter_mut() {
            if other.command.kind() == kind
                && other.command.prepare_dependent_retry(policy.as_ref())
            {
                Logger::trace(
                    Event::CommandRetried.as_str(),
                    &[("kind", kind.as_str()), ("dependent", "true")],
                );
            }
        }
        batch.push_front(pending);
        true
    }

    fn note_retry(&self, kind: &str, attempt: u32, error: &CommandError) {
        self.metrics.increment_commands_retried();
        Logger::warn(
            Event::CommandRetried.as_str(),
            &[
                ("kind", kind),
                ("attempt", &attempt.to_string()),
                ("error", &error.to_string()),
            ],
        );
    }

    fn commit(&mut self, tx: LowLevelTransaction, tx_id: TxId, executed: Vec<(Pending, u64)>) {
        match tx.commit() {
            Ok(committed_id) => {
                self.record(|r| r.end_batch(tx_id, true));
                let operations: u64 = executed.iter().map(|(_, count)| *count).sum();
                self.metrics.add_commands_executed(executed.len() as u64);
                if !executed.is_empty() {
                    Logger::info(
                        Event::BatchCommitted.as_str(),
                        &[
                            ("tx_id", &committed_id.to_string()),
                            ("commands", &executed.len().to_string()),
                            ("operations", &operations.to_string()),
                        ],
                    );
                }
                for (pending, count) in executed {
                    pending.resolve(Ok(count));
                }
            }
            Err(e) => self.fail_batch(tx_id, executed, e),
        }
    }

    fn fail_batch(&mut self, tx_id: TxId, executed: Vec<(Pending, u64)>, error: TxError) {
        self.record(|r| r.end_batch(tx_id, false));
        self.metrics.increment_batches_failed();
        Logger::error(
            Event::BatchFailed.as_str(),
            &[
                ("tx_id", &tx_id.to_string()),
                ("commands", &executed.len().to_string()),
                ("error", &error.to_string()),
            ],
        );

        let error = Arc::new(error);
        for (pending, _) in executed {
            self.metrics.increment_commands_failed();
            pending.resolve(Err(MergerError::Transaction(Arc::clone(&error))));
        }
    }

    /// Write to the recorder if there is one; failures are logged, not fatal
    fn record(&mut self, write: impl FnOnce(&mut CommandRecorder) -> Result<(), RecordingError>) {
        let Some(recorder) = self.config.recorder.as_mut() else {
            return;
        };
        if let Err(e) = write(recorder) {
            Logger::warn(
                Event::CommandRejected.as_str(),
                &[
                    ("recording", &recorder.path().display().to_string()),
                    ("error", &e.to_string()),
                ],
            );
        }
    }
}
