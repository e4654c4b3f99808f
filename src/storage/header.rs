//! File header page (page 0)
//!
//! ```text
//! Offset  Size  Field
//! 0       16    Page header (flags = Header)
//! 16      8     Magic "AEROSTOR"
//! 24      4     Format version
//! 28      4     Page size
//! 32      8     next_page_number
//! 40      8     freelist_head (0 = empty)
//! 48      8     free_pages
//! 56      4     CRC32 over bytes 16..56
//! ```
//!
//! The header page is modified inside write transactions like any other
//! page, so it is journaled and recovered together with the pages whose
//! allocation it records.

use super::checksum::compute_checksum;
use super::errors::{StorageError, StorageResult};
use super::page::{read_u32, read_u64, write_u32, write_u64, PageFlags, PageHeader, PageNumber, PAGE_SIZE};

pub const FILE_MAGIC: &[u8; 8] = b"AEROSTOR";
pub const FORMAT_VERSION: u32 = 1;

/// Page number of the file header
pub const HEADER_PAGE: PageNumber = 0;

const MAGIC_OFFSET: usize = 16;
const VERSION_OFFSET: usize = 24;
const PAGE_SIZE_OFFSET: usize = 28;
const NEXT_PAGE_OFFSET: usize = 32;
const FREELIST_HEAD_OFFSET: usize = 40;
const FREE_PAGES_OFFSET: usize = 48;
const CRC_OFFSET: usize = 56;

/// Allocation state of the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Next never-used page number; pages `1..next_page_number` are in use or free
    pub next_page_number: PageNumber,
    /// First free-list trunk page, 0 when the free list is empty
    pub freelist_head: PageNumber,
    /// Pages currently on the free list (trunk pages included)
    pub free_pages: u64,
}

impl FileHeader {
    /// Header of a freshly created file
    pub fn new() -> Self {
        Self {
            next_page_number: HEADER_PAGE + 1,
            freelist_head: 0,
            free_pages: 0,
        }
    }

    /// Parse and validate the header page
    pub fn read(page: &[u8]) -> StorageResult<Self> {
        if page.len() < PAGE_SIZE {
            return Err(StorageError::invalid_format("header page is truncated"));
        }
        if &page[MAGIC_OFFSET..MAGIC_OFFSET + 8] != FILE_MAGIC {
            return Err(StorageError::invalid_format("bad file magic"));
        }

        let version = read_u32(page, VERSION_OFFSET);
        if version != FORMAT_VERSION {
            return Err(StorageError::invalid_format(format!(
                "unsupported format version {}",
                version
            )));
        }

        let page_size = read_u32(page, PAGE_SIZE_OFFSET) as usize;
        if page_size != PAGE_SIZE {
            return Err(StorageError::invalid_format(format!(
                "page size {} does not match compiled page size {}",
                page_size, PAGE_SIZE
            )));
        }

        let stored = read_u32(page, CRC_OFFSET);
        if compute_checksum(&page[MAGIC_OFFSET..CRC_OFFSET]) != stored {
            return Err(StorageError::corruption_at_page(
                HEADER_PAGE,
                "file header checksum mismatch",
            ));
        }

        Ok(Self {
            next_page_number: read_u64(page, NEXT_PAGE_OFFSET),
            freelist_head: read_u64(page, FREELIST_HEAD_OFFSET),
            free_pages: read_u64(page, FREE_PAGES_OFFSET),
        })
    }

    /// Serialize into a header page buffer
    pub fn write(&self, page: &mut [u8]) {
        PageHeader::new(HEADER_PAGE, PageFlags::Header).write(page);
        page[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(FILE_MAGIC);
        write_u32(page, VERSION_OFFSET, FORMAT_VERSION);
        write_u32(page, PAGE_SIZE_OFFSET, PAGE_SIZE as u32);
        write_u64(page, NEXT_PAGE_OFFSET, self.next_page_number);
        write_u64(page, FREELIST_HEAD_OFFSET, self.freelist_head);
        write_u64(page, FREE_PAGES_OFFSET, self.free_pages);
        let crc = compute_checksum(&page[MAGIC_OFFSET..CRC_OFFSET]);
        write_u32(page, CRC_OFFSET, crc);
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_reserves_page_zero() {
        assert_eq!(FileHeader::new().next_page_number, 1);
    }

    #[test]
    fn test_write_then_read() {
        let mut page = vec![0u8; PAGE_SIZE];
        let header = FileHeader {
            next_page_number: 40,
            freelist_head: 12,
            free_pages: 5,
        };
        header.write(&mut page);
        assert_eq!(FileHeader::read(&page).unwrap(), header);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut page = vec![0u8; PAGE_SIZE];
        FileHeader::new().write(&mut page);
        page[MAGIC_OFFSET] = b'X';
        let err = FileHeader::read(&page).unwrap_err();
        assert_eq!(err.code().code(), "AERO_STORAGE_INVALID_FORMAT");
    }

    #[test]
    fn test_flipped_field_detected() {
        let mut page = vec![0u8; PAGE_SIZE];
        FileHeader::new().write(&mut page);
        page[NEXT_PAGE_OFFSET] ^= 0x10;
        let err = FileHeader::read(&page).unwrap_err();
        assert_eq!(err.code().code(), "AERO_STORAGE_CORRUPTION");
    }
}
