//! Page store for aerostore
//!
//! The data file is a memory-mapped sequence of fixed-size pages. Page 0
//! holds the file header; every other page is either in use, on the free
//! list, or beyond `next_page_number`.
//!
//! # Design Principles
//!
//! - Pages are addressed by number, never by raw offset
//! - Overflow content spans `PageRef { number, count }` contiguous pages
//! - Every access is bounds-checked against the mapped size
//! - The data file is only written by recovery and the flusher
//!
//! # Invariants Enforced
//!
//! - The header page is CRC-protected and validated on open
//! - A freed page is not reused while a reader that predates the free is alive
//! - Corruption is FATAL; I/O and bounds errors are not

mod checksum;
mod errors;
pub mod freelist;
mod header;
mod page;
mod pager;

pub use checksum::{compute_checksum, compute_checksum_parts, verify_checksum};
pub use errors::{Severity, StorageError, StorageErrorCode, StorageResult};
pub use freelist::{FreeList, PageAccess, TRUNK_CAPACITY};
pub use header::{FileHeader, FORMAT_VERSION, HEADER_PAGE};
pub use page::{PageFlags, PageHeader, PageNumber, PageRef, PAGE_HEADER_SIZE, PAGE_SIZE};
pub use pager::{read_file_header, Pager};

pub(crate) use page::{read_u32, read_u64, write_u32, write_u64};
