//! Rate-limited batch driver
//!
//! Feeds items from a shared queue into inner commands inside one merged
//! transaction, as fast as the rate gate allows. Items are removed from the
//! queue by a dispose hook only when the transaction commits, so a rolled
//! back batch leaves the queue untouched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::merger::{CommandError, MergedCommand, ReplayableCommandDto, TransactionContext};

use super::cancel::OperationCancelToken;
use super::gate::RateGate;

pub const RATE_LIMITED_KIND: &str = "rate_limited";

/// Source queue shared between the caller and the driver
pub type SharedQueue<T> = Arc<Mutex<VecDeque<T>>>;

type CommandFactory<T> = Box<dyn Fn(&T) -> Option<Box<dyn MergedCommand>> + Send>;

/// Outcome of the last run, readable after the command was handed to the merger
#[derive(Debug, Default)]
pub struct RateLimitedStats {
    needs_wait: AtomicBool,
    processed: AtomicU64,
}

impl RateLimitedStats {
    /// The rate gate ran dry; schedule another batch later
    pub fn needs_wait(&self) -> bool {
        self.needs_wait.load(Ordering::Acquire)
    }

    /// Operations reported by the inner commands, across every run
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }
}

pub struct ExecuteRateLimitedOperations<T> {
    queue: SharedQueue<T>,
    factory: CommandFactory<T>,
    gate: Option<Arc<RateGate>>,
    token: OperationCancelToken,
    /// Ceiling on operations processed across every run of this driver
    batch_size: Option<u64>,
    stats: Arc<RateLimitedStats>,
}

impl<T: Clone + Send + 'static> ExecuteRateLimitedOperations<T> {
    pub fn new(
        queue: SharedQueue<T>,
        factory: impl Fn(&T) -> Option<Box<dyn MergedCommand>> + Send + 'static,
        gate: Option<Arc<RateGate>>,
        token: OperationCancelToken,
        batch_size: Option<u64>,
    ) -> Self {
        Self {
            queue,
            factory: Box::new(factory),
            gate,
            token,
            batch_size,
            stats: Arc::new(RateLimitedStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RateLimitedStats> {
        Arc::clone(&self.stats)
    }
}

impl<T: Clone + Send + 'static> MergedCommand for ExecuteRateLimitedOperations<T> {
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
        self.stats.needs_wait.store(false, Ordering::Release);
        let mut iterated = 0usize;
        let mut processed = 0u64;

        loop {
            let Some(item) = self.queue.lock().get(iterated).cloned() else {
                break;
            };

            self.token.check()?;
            self.token.delay();

            if let Some(gate) = &self.gate {
                if !gate.wait_to_proceed(Duration::ZERO) {
                    self.stats.needs_wait.store(true, Ordering::Release);
                    break;
                }
            }

            iterated += 1;
            if let Some(mut command) = (self.factory)(&item) {
                processed += command.execute(ctx)?;
            }

            if self
                .batch_size
                .is_some_and(|size| self.stats.processed() + processed >= size)
            {
                break;
            }
            if !ctx.can_continue() {
                break;
            }
            let cached = ctx.cached_properties();
            if cached.need_clear() {
                cached.clear_renew();
            }
        }

        let queue = Arc::clone(&self.queue);
        ctx.on_dispose(move |outcome| {
            if !outcome.committed {
                return;
            }
            let mut queue = queue.lock();
            for _ in 0..iterated {
                queue.pop_front();
            }
        })?;

        self.stats.processed.fetch_add(processed, Ordering::AcqRel);
        Ok(processed)
    }

    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
        Err(CommandError::NotSupported(format!(
            "to_dto of {RATE_LIMITED_KIND} operations"
        )))
    }

    fn kind(&self) -> &str {
        RATE_LIMITED_KIND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::merger::CachedProperties;
    use crate::tx::StorageEnvironment;
    use tempfile::TempDir;

    struct Count;

    impl MergedCommand for Count {
        fn execute(&mut self, _ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError> {
            Ok(1)
        }

        fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError> {
            Ok(ReplayableCommandDto::new("count", serde_json::Value::Null))
        }

        fn kind(&self) -> &str {
            "count"
        }
    }

    fn env(dir: &TempDir) -> StorageEnvironment {
        let mut config = EngineConfig::new(dir.path());
        config.flush.interval_ms = 60_000;
        StorageEnvironment::open(config).unwrap()
    }

    fn queue(n: u32) -> SharedQueue<u32> {
        Arc::new(Mutex::new((0..n).collect()))
    }

    fn driver(queue: &SharedQueue<u32>, gate: Option<Arc<RateGate>>, batch: Option<u64>) -> ExecuteRateLimitedOperations<u32> {
        ExecuteRateLimitedOperations::new(
            Arc::clone(queue),
            |_| Some(Box::new(Count) as Box<dyn MergedCommand>),
            gate,
            OperationCancelToken::none(),
            batch,
        )
    }

    #[test]
    fn test_batch_size_ceiling() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let items = queue(8);
        let mut command = driver(&items, None, Some(5));

        let mut tx = env.write_transaction().unwrap();
        let mut cached = CachedProperties::new();
        let processed = command
            .execute(&mut TransactionContext::new(&mut tx, &mut cached))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(processed, 5);
        assert!(!command.stats().needs_wait());
        assert_eq!(items.lock().len(), 3);
    }

    #[test]
    fn test_batch_size_ceiling_spans_runs() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let items = queue(8);
        let mut command = driver(&items, None, Some(5));
        let mut cached = CachedProperties::new();

        let mut tx = env.write_transaction().unwrap();
        let first = command
            .execute(&mut TransactionContext::new(&mut tx, &mut cached))
            .unwrap();
        tx.commit().unwrap();

        // The ceiling is already reached: one item per further run.
        let mut tx = env.write_transaction().unwrap();
        let second = command
            .execute(&mut TransactionContext::new(&mut tx, &mut cached))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!((first, second), (5, 1));
        assert_eq!(command.stats().processed(), 6);
        assert_eq!(items.lock().len(), 2);
    }

    #[test]
    fn test_cancelled_token_stops_before_first_item() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let items = queue(3);
        let token = OperationCancelToken::none();
        token.cancel();
        let mut command = ExecuteRateLimitedOperations::new(
            Arc::clone(&items),
            |_: &u32| Some(Box::new(Count) as Box<dyn MergedCommand>),
            None,
            token,
            None,
        );

        let mut tx = env.write_transaction().unwrap();
        let mut cached = CachedProperties::new();
        let result = command.execute(&mut TransactionContext::new(&mut tx, &mut cached));
        assert!(matches!(result, Err(CommandError::Cancelled)));
        tx.commit().unwrap();
        assert_eq!(items.lock().len(), 3);
    }

    #[test]
    fn test_to_dto_not_supported() {
        let items = queue(1);
        let command = driver(&items, Some(Arc::new(RateGate::manual(1))), None);
        assert!(matches!(command.to_dto(), Err(CommandError::NotSupported(_))));
    }
}
