//! Journal subsystem for aerostore
//!
//! Every committed write transaction is appended to the journal as one
//! record holding full images of its dirty pages. The data file is only
//! updated later, by the flusher, or by recovery after a crash.
//!
//! # Design Principles
//!
//! - Journal files are numbered and totally ordered; replay follows that order
//! - A record is acknowledged only after the configured durability barrier
//! - Each process appends to a fresh file; old files are read-only
//! - Journals are recycled only after the flush marker covers them
//!
//! # Invariants Enforced
//!
//! - Transaction ids strictly increase across the journal sequence
//! - A torn tail ends the log; anything else invalid is FATAL corruption
//! - Replay is idempotent

mod errors;
mod file;
mod flusher;
mod marker;
mod reader;
mod record;
mod recovery;
mod writer;

pub use errors::{JournalError, JournalErrorCode, JournalResult};
pub use file::{journal_path, list_journals, recyclable_path, JournalListing, JournalSnapshot};
pub use flusher::{Backoff, FlushJob, FlushOutcome, FlushSettings, FlusherHandle};
pub use marker::{marker_path, FlushMarker};
pub use reader::JournalReader;
pub use record::{JournalTransaction, PageEntry, UNIT_SIZE};
pub use recovery::{recover, JournalReplayer, PageApply, ReplayStats};
pub use writer::{JournalConfig, JournalWriter, SyncMode};
