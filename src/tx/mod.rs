//! Low-level transactions for aerostore
//!
//! A [`StorageEnvironment`] hands out read transactions pinned to a
//! committed snapshot and at most one write transaction at a time.
//!
//! # Design Principles
//!
//! - Writers never block readers; readers see immutable committed versions
//! - Dirty pages are staged in scratch memory and journaled as a unit
//! - Commit order equals transaction id order
//!
//! # Invariants Enforced
//!
//! - Transaction ids strictly increase
//! - A transaction is visible only after its journal record was appended
//! - Dropping an uncommitted write transaction rolls it back

mod env;
mod errors;
mod state;
mod transaction;
mod versions;

pub use env::StorageEnvironment;
pub use errors::{TxError, TxResult};
pub use state::{TransactionMode, TxId, TxOutcome, TxState};
pub use transaction::{DisposeHook, LowLevelTransaction, PageView};
pub use versions::{ReaderRegistry, VersionTable};
