//! Merger and command errors

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::tx::TxError;

use super::recording::RecordingError;

/// Failure of one merged command
#[derive(Debug, Error)]
pub enum CommandError {
    /// Collision with committed state; the merger may retry the command
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    /// The command does not support this capability (e.g. replay)
    #[error("{0} is not supported")]
    NotSupported(String),

    #[error("command failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Transaction(TxError),
}

impl CommandError {
    /// Errors that abort the whole physical transaction
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::Transaction(e) if e.is_fatal())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, CommandError::Concurrency(_))
    }
}

impl From<TxError> for CommandError {
    fn from(e: TxError) -> Self {
        match e {
            TxError::Concurrency(message) => CommandError::Concurrency(message),
            other => CommandError::Transaction(other),
        }
    }
}

/// Error delivered to the caller of `enqueue`
#[derive(Debug, Error)]
pub enum MergerError {
    #[error("timed out after {0:?} waiting for the merger")]
    Timeout(Duration),

    /// A caller broke the command contract (e.g. an unreplayable command was recorded)
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The physical transaction failed; every command in it failed with it
    #[error("transaction failed: {0}")]
    Transaction(#[source] Arc<TxError>),

    #[error(transparent)]
    Command(CommandError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("merger is shut down")]
    Shutdown,

    #[error("failed to start merger thread: {0}")]
    Start(#[source] std::io::Error),
}

impl MergerError {
    /// Waiting for the merger or the command's own token ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MergerError::Timeout(_) | MergerError::Command(CommandError::Timeout)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergerError::Command(CommandError::Cancelled))
    }
}

impl From<CommandError> for MergerError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::NotSupported(what) => MergerError::ContractViolation(what),
            other => MergerError::Command(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    #[test]
    fn test_tx_concurrency_becomes_recoverable() {
        let err: CommandError = TxError::Concurrency("users/1".into()).into();
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_storage_error_is_fatal() {
        let err: CommandError = TxError::Storage(StorageError::corruption("torn page")).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_supported_is_contract_violation() {
        let err: MergerError = CommandError::NotSupported("to_dto of rate_limited".into()).into();
        assert!(matches!(err, MergerError::ContractViolation(_)));
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = MergerError::Timeout(Duration::from_millis(5));
        let cancelled: MergerError = CommandError::Cancelled.into();
        assert!(timeout.is_timeout() && !timeout.is_cancelled());
        assert!(cancelled.is_cancelled() && !cancelled.is_timeout());

        let expired: MergerError = CommandError::Timeout.into();
        assert!(expired.is_timeout() && !expired.is_cancelled());
    }
}
