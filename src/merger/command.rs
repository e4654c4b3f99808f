//! Merged command contract

use serde::{Deserialize, Serialize};

use super::context::TransactionContext;
use super::errors::CommandError;
use super::retry::IdRetryPolicy;

/// Serialized form of a command, enough to rebuild it for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayableCommandDto {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl ReplayableCommandDto {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// A unit of write work executed by the merger inside a shared transaction.
///
/// `execute` may run more than once when the merger retries the command
/// after a conflict; each run happens in a fresh savepoint, so effects of a
/// failed run are discarded.
pub trait MergedCommand: Send + 'static {
    /// Apply the command, returning the number of logical operations done
    fn execute(&mut self, ctx: &mut TransactionContext<'_>) -> Result<u64, CommandError>;

    /// Replay descriptor; `NotSupported` for commands that cannot be replayed
    fn to_dto(&self) -> Result<ReplayableCommandDto, CommandError>;

    /// Approximate bytes this command will write
    fn estimate_size(&self) -> u64 {
        0
    }

    /// Commands of the same kind are retried together after a conflict
    fn kind(&self) -> &str;

    /// Rewrite identities so a retry cannot hit the same conflict.
    /// Returns true when the command should be re-run.
    fn prepare_retry(&mut self, _policy: &dyn IdRetryPolicy) -> bool {
        false
    }

    /// A command of the same kind, queued behind one that conflicted and not
    /// yet executed. Returns true when identities were rewritten.
    fn prepare_dependent_retry(&mut self, _policy: &dyn IdRetryPolicy) -> bool {
        false
    }
}
