//! aerostore - transactional page storage with a write-ahead journal
//!
//! Pages live in a single memory-mapped data file. Writers stage dirty pages
//! in scratch arenas, commit them to an append-only journal, and a
//! background flusher later applies journaled pages to the data file.
//! Readers see immutable snapshots. All writes go through one merger thread
//! that batches many small commands into one physical transaction.

pub mod cli;
pub mod config;
pub mod journal;
pub mod merger;
pub mod observability;
pub mod rate_limit;
pub mod report;
pub mod scratch;
pub mod storage;
pub mod tx;
