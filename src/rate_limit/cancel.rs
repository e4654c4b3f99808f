//! Cancellation and timeout for long-running operations
//!
//! Checked between items only, never in the middle of a page write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::merger::CommandError;

struct TokenState {
    cancelled: AtomicBool,
    timeout: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct OperationCancelToken {
    state: Arc<TokenState>,
}

impl OperationCancelToken {
    /// Token that times out `timeout` after creation or the last `delay()`
    pub fn new(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    /// Token that only ends on `cancel()`
    pub fn none() -> Self {
        Self::build(None)
    }

    fn build(timeout: Option<Duration>) -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                timeout,
                deadline: Mutex::new(timeout.map(|t| Instant::now() + t)),
            }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Push the timeout deadline forward; called while work makes progress
    pub fn delay(&self) {
        if let Some(timeout) = self.state.timeout {
            let mut deadline = self.state.deadline.lock();
            if !deadline.is_some_and(|d| Instant::now() >= d) {
                *deadline = Some(Instant::now() + timeout);
            }
        }
    }

    /// `Cancelled` or `Timeout` once the operation must stop
    pub fn check(&self) -> Result<(), CommandError> {
        if self.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        if self
            .state
            .deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Err(CommandError::Timeout);
        }
        Ok(())
    }
}

impl Default for OperationCancelToken {
    fn default() -> Self {
        Self::none()
    }
}
