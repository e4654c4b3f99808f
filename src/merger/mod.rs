//! Transaction operations merger for aerostore
//!
//! Every write goes through one merger. Callers enqueue commands from any
//! thread; a single writer thread groups them into physical transactions so
//! many small writes share one journal append.
//!
//! # Design Principles
//!
//! - One writer: commands never race each other for pages
//! - The physical transaction is the atomicity boundary
//! - A failing command only fails itself, unless it breaks the transaction
//!
//! # Invariants Enforced
//!
//! - A command is resolved successfully only after its transaction committed
//! - Commands run in enqueue order within a transaction
//! - Cached properties never outlive a transaction

pub mod bulk;
mod command;
mod context;
mod errors;
mod recording;
mod retry;
mod scheduler;

pub use bulk::{
    BulkInsertBatcher, BulkInsertCommand, BulkInsertProgress, BulkOperation, BULK_INSERT_KIND,
};
pub use command::{MergedCommand, ReplayableCommandDto};
pub use context::{CachedProperties, TransactionContext};
pub use errors::{CommandError, MergerError};
pub use recording::{CommandRecorder, CommandRegistry, RecordedEntry, RecordingError, ReplayedBatch};
pub use retry::{IdRetryPolicy, SuffixSeparatorPolicy, DEFAULT_IDENTITY_SEPARATOR};
pub use scheduler::{MergerConfig, TransactionOperationsMerger};
