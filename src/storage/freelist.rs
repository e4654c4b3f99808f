//! Free page tracking
//!
//! Freed pages are kept in a chain of trunk pages whose head is recorded in
//! the file header. Every entry remembers the transaction that freed it so
//! that a page is never handed out while a reader that predates the free
//! could still reach it.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size  Description
//! 0       16    PageHeader (flags = FreeList)
//! 16      8     next_trunk (0 = none)
//! 24      8     freed_at_tx of the trunk page itself
//! 32      4     count
//! 36      4     padding
//! 40      16*N  entries: (page_number u64, freed_at_tx u64)
//! ```
//!
//! ## Allocation
//!
//! 1. Single pages come from the head trunk when it holds an entry freed
//!    before `safe_before_tx`.
//! 2. An empty head trunk is itself reused once it is old enough.
//! 3. Otherwise the file grows through `next_page_number`.
//!
//! Overflow runs always grow the file; free runs are not coalesced.
//!
//! The free list never touches the data file directly. All reads and writes
//! go through [`PageAccess`], which the write transaction implements with
//! copy-on-write pages, so free-list changes commit and roll back with the
//! transaction that made them.

use super::errors::StorageError;
use super::header::FileHeader;
use super::page::{read_u32, read_u64, write_u32, write_u64, PageFlags, PageHeader, PageNumber, PageRef, PAGE_SIZE};

const NEXT_TRUNK_OFFSET: usize = 16;
const TRUNK_FREED_AT_OFFSET: usize = 24;
const COUNT_OFFSET: usize = 32;
const ENTRIES_OFFSET: usize = 40;
const ENTRY_SIZE: usize = 16;

/// Entries that fit in one trunk page
pub const TRUNK_CAPACITY: usize = (PAGE_SIZE - ENTRIES_OFFSET) / ENTRY_SIZE;

/// Page-level access used by the free list
pub trait PageAccess {
    type Error: From<StorageError>;

    /// Current content of a single page
    fn read_page(&self, page_number: PageNumber) -> Result<Vec<u8>, Self::Error>;

    /// Writable copy of an existing page
    fn write_page(&mut self, page_number: PageNumber) -> Result<&mut [u8], Self::Error>;

    /// Writable zeroed run that does not need its previous content
    fn fresh_page(&mut self, page_ref: PageRef) -> Result<&mut [u8], Self::Error>;
}

/// Free list operations over a transaction's pages and header
pub struct FreeList;

impl FreeList {
    /// Allocate `count` contiguous pages.
    ///
    /// Reused pages are only returned when they were freed by a transaction
    /// with an id below `safe_before_tx`. The returned run's content is not
    /// initialized; callers obtain it through [`PageAccess::fresh_page`].
    pub fn allocate<A: PageAccess>(
        access: &mut A,
        header: &mut FileHeader,
        count: u32,
        safe_before_tx: u64,
    ) -> Result<PageRef, A::Error> {
        if count == 0 {
            let next = header.next_page_number;
            return Err(StorageError::invalid_page_ref(next, "allocation of zero pages").into());
        }

        if count == 1 && header.freelist_head != 0 {
            if let Some(page) = Self::take_from_head(access, header, safe_before_tx)? {
                return Ok(PageRef::single(page));
            }
        }

        let first = header.next_page_number;
        header.next_page_number += count as u64;
        Ok(PageRef::overflow(first, count))
    }

    /// Return every page of `page_ref` to the free list.
    ///
    /// A page still held by the head trunk, or the head trunk itself, is a
    /// double free and is rejected.
    pub fn free<A: PageAccess>(
        access: &mut A,
        header: &mut FileHeader,
        page_ref: PageRef,
        freed_at_tx: u64,
    ) -> Result<(), A::Error> {
        Self::check_free(access, header, page_ref)?;

        for page in page_ref.number..page_ref.end() {
            Self::push(access, header, page, freed_at_tx)?;
        }
        Ok(())
    }

    /// Reject a free of pages that are unallocated or already free
    pub fn check_free<A: PageAccess>(
        access: &A,
        header: &FileHeader,
        page_ref: PageRef,
    ) -> Result<(), A::Error> {
        if page_ref.number == 0 || page_ref.end() > header.next_page_number {
            return Err(StorageError::invalid_page_ref(
                page_ref.number,
                format!(
                    "free of unallocated run (count {}, next_page_number {})",
                    page_ref.count, header.next_page_number
                ),
            )
            .into());
        }
        if let Some(page) = Self::listed_in_head(access, header, page_ref)? {
            return Err(StorageError::invalid_page_ref(page, "page is already free").into());
        }
        Ok(())
    }

    fn listed_in_head<A: PageAccess>(
        access: &A,
        header: &FileHeader,
        page_ref: PageRef,
    ) -> Result<Option<PageNumber>, A::Error> {
        let head = header.freelist_head;
        if head == 0 {
            return Ok(None);
        }
        if page_ref.contains(head) {
            return Ok(Some(head));
        }
        let trunk = access.read_page(head)?;
        let count = (read_u32(&trunk, COUNT_OFFSET) as usize).min(TRUNK_CAPACITY);
        Ok((0..count)
            .map(|i| read_u64(&trunk, ENTRIES_OFFSET + i * ENTRY_SIZE))
            .find(|page| page_ref.contains(*page)))
    }

    /// Pages currently on the free list, trunk pages included
    pub fn free_page_count(header: &FileHeader) -> u64 {
        header.free_pages
    }

    fn take_from_head<A: PageAccess>(
        access: &mut A,
        header: &mut FileHeader,
        safe_before_tx: u64,
    ) -> Result<Option<PageNumber>, A::Error> {
        let head = header.freelist_head;
        let trunk = access.read_page(head)?;
        Self::check_trunk(head, &trunk)?;

        let count = read_u32(&trunk, COUNT_OFFSET) as usize;
        let candidate = (0..count).rev().find(|i| {
            let offset = ENTRIES_OFFSET + i * ENTRY_SIZE;
            read_u64(&trunk, offset + 8) < safe_before_tx
        });

        if let Some(index) = candidate {
            let page = read_u64(&trunk, ENTRIES_OFFSET + index * ENTRY_SIZE);
            let last = count - 1;
            let buf = access.write_page(head)?;
            if index != last {
                let from = ENTRIES_OFFSET + last * ENTRY_SIZE;
                let to = ENTRIES_OFFSET + index * ENTRY_SIZE;
                buf.copy_within(from..from + ENTRY_SIZE, to);
            }
            let last_offset = ENTRIES_OFFSET + last * ENTRY_SIZE;
            buf[last_offset..last_offset + ENTRY_SIZE].fill(0);
            write_u32(buf, COUNT_OFFSET, last as u32);
            header.free_pages = header.free_pages.saturating_sub(1);
            return Ok(Some(page));
        }

        if count == 0 && read_u64(&trunk, TRUNK_FREED_AT_OFFSET) < safe_before_tx {
            header.freelist_head = read_u64(&trunk, NEXT_TRUNK_OFFSET);
            header.free_pages = header.free_pages.saturating_sub(1);
            return Ok(Some(head));
        }

        Ok(None)
    }

    fn push<A: PageAccess>(
        access: &mut A,
        header: &mut FileHeader,
        page: PageNumber,
        freed_at_tx: u64,
    ) -> Result<(), A::Error> {
        let head = header.freelist_head;
        if head != 0 {
            let buf = access.write_page(head)?;
            let count = read_u32(buf, COUNT_OFFSET) as usize;
            if count < TRUNK_CAPACITY {
                let offset = ENTRIES_OFFSET + count * ENTRY_SIZE;
                write_u64(buf, offset, page);
                write_u64(buf, offset + 8, freed_at_tx);
                write_u32(buf, COUNT_OFFSET, count as u32 + 1);
                header.free_pages += 1;
                return Ok(());
            }
        }

        // No room: the freed page becomes the new head trunk.
        let buf = access.fresh_page(PageRef::single(page))?;
        PageHeader::new(page, PageFlags::FreeList).write(buf);
        write_u64(buf, NEXT_TRUNK_OFFSET, head);
        write_u64(buf, TRUNK_FREED_AT_OFFSET, freed_at_tx);
        write_u32(buf, COUNT_OFFSET, 0);
        header.freelist_head = page;
        header.free_pages += 1;
        Ok(())
    }

    fn check_trunk(page_number: PageNumber, trunk: &[u8]) -> Result<(), StorageError> {
        let page_header = PageHeader::read(trunk)?;
        if page_header.flags != PageFlags::FreeList {
            return Err(StorageError::corruption_at_page(
                page_number,
                format!("free-list head has flags {:?}", page_header.flags),
            ));
        }
        if read_u32(trunk, COUNT_OFFSET) as usize > TRUNK_CAPACITY {
            return Err(StorageError::corruption_at_page(
                page_number,
                "free-list trunk count exceeds capacity",
            ));
        }
        Ok(())
    }
}
