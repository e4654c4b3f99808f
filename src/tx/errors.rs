//! Transaction errors

use thiserror::Error;

use crate::journal::JournalError;
use crate::scratch::ScratchError;
use crate::storage::StorageError;

use super::state::{TxId, TxState};

pub type TxResult<T> = Result<T, TxError>;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Journal(#[from] JournalError),

    #[error("{0}")]
    Scratch(#[from] ScratchError),

    /// A write collided with state committed by an earlier transaction.
    /// Recoverable: the operation may be retried in a new transaction.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("transaction {tx_id} is {state}, cannot {operation}")]
    InvalidState {
        tx_id: TxId,
        state: TxState,
        operation: &'static str,
    },

    #[error("another write transaction is active")]
    WriterBusy,

    #[error("transaction {0} is read-only")]
    ReadOnly(TxId),

    /// A journal append failed; the environment accepts no more writes
    #[error("storage environment failed: {0}")]
    Failed(String),
}

impl TxError {
    /// Errors after which the transaction, and every command in it, must fail
    pub fn is_fatal(&self) -> bool {
        match self {
            TxError::Storage(e) => e.is_fatal(),
            TxError::Journal(_) | TxError::Failed(_) => true,
            TxError::Scratch(_)
            | TxError::Concurrency(_)
            | TxError::InvalidState { .. }
            | TxError::WriterBusy
            | TxError::ReadOnly(_) => false,
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, TxError::Concurrency(_))
    }
}
