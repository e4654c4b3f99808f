//! Page layout
//!
//! The data file is a sequence of fixed-size pages:
//!
//! ```text
//! Offset 0:            Page 0 (file header)
//! Offset PAGE_SIZE:    Page 1
//! Offset 2*PAGE_SIZE:  Page 2
//! ...
//! ```
//!
//! Every page starts with a 16-byte page header:
//!
//! ```text
//! 0       8           9           12              16
//! +-------+-----------+-----------+---------------+
//! | page# | flags(u8) | reserved  | overflow_size |
//! +-------+-----------+-----------+---------------+
//! ```
//!
//! An overflow page occupies `count` contiguous physical pages; it is
//! addressed by its first page number plus the page count, never by
//! walking raw offsets.

use super::errors::{StorageError, StorageResult};

/// Size of one physical page in bytes
pub const PAGE_SIZE: usize = 8192;

/// Size of the header at the start of every page
pub const PAGE_HEADER_SIZE: usize = 16;

/// Page numbers are monotonically assigned by the header page
pub type PageNumber = u64;

/// Kind of content a page holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageFlags {
    /// Never written
    Empty = 0,
    /// File header (page 0 only)
    Header = 1,
    /// Single data page
    Single = 2,
    /// First page of an overflow run
    Overflow = 3,
    /// Free-list trunk page
    FreeList = 4,
}

impl PageFlags {
    /// Convert from u8, returns None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageFlags::Empty),
            1 => Some(PageFlags::Header),
            2 => Some(PageFlags::Single),
            3 => Some(PageFlags::Overflow),
            4 => Some(PageFlags::FreeList),
            _ => None,
        }
    }
}

/// A run of `count` contiguous pages starting at `number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRef {
    pub number: PageNumber,
    pub count: u32,
}

impl PageRef {
    /// A single page
    pub fn single(number: PageNumber) -> Self {
        Self { number, count: 1 }
    }

    /// An overflow run
    pub fn overflow(number: PageNumber, count: u32) -> Self {
        Self { number, count }
    }

    /// Number of physical pages needed to hold `size` payload bytes
    pub fn pages_for(size: usize) -> u32 {
        let total = size + PAGE_HEADER_SIZE;
        ((total + PAGE_SIZE - 1) / PAGE_SIZE).max(1) as u32
    }

    /// Byte length of the whole run
    pub fn byte_len(&self) -> usize {
        self.count as usize * PAGE_SIZE
    }

    /// Byte offset of the first page in the data file
    pub fn file_offset(&self) -> u64 {
        self.number * PAGE_SIZE as u64
    }

    /// One past the last page number of the run
    pub fn end(&self) -> PageNumber {
        self.number + self.count as u64
    }

    /// Whether the run covers `page_number`
    pub fn contains(&self, page_number: PageNumber) -> bool {
        page_number >= self.number && page_number < self.end()
    }
}

/// Header stored in the first 16 bytes of every page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_number: PageNumber,
    pub flags: PageFlags,
    /// Payload bytes stored in an overflow run (0 for single pages)
    pub overflow_size: u32,
}

impl PageHeader {
    pub fn new(page_number: PageNumber, flags: PageFlags) -> Self {
        Self {
            page_number,
            flags,
            overflow_size: 0,
        }
    }

    pub fn overflow(page_number: PageNumber, overflow_size: u32) -> Self {
        Self {
            page_number,
            flags: PageFlags::Overflow,
            overflow_size,
        }
    }

    /// Parse a page header from the start of a page buffer
    pub fn read(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(StorageError::corruption("page buffer shorter than page header"));
        }
        let page_number = read_u64(buf, 0);
        let flags = PageFlags::from_u8(buf[8]).ok_or_else(|| {
            StorageError::corruption_at_page(page_number, format!("unknown page flags {}", buf[8]))
        })?;
        let overflow_size = read_u32(buf, 12);
        Ok(Self {
            page_number,
            flags,
            overflow_size,
        })
    }

    /// Write this header into the start of a page buffer
    pub fn write(&self, buf: &mut [u8]) {
        write_u64(buf, 0, self.page_number);
        buf[8] = self.flags as u8;
        buf[9..12].fill(0);
        write_u32(buf, 12, self.overflow_size);
    }

    /// Number of physical pages this page spans
    pub fn page_count(&self) -> u32 {
        match self.flags {
            PageFlags::Overflow => PageRef::pages_for(self.overflow_size as usize),
            _ => 1,
        }
    }
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for_boundaries() {
        assert_eq!(PageRef::pages_for(0), 1);
        assert_eq!(PageRef::pages_for(PAGE_SIZE - PAGE_HEADER_SIZE), 1);
        assert_eq!(PageRef::pages_for(PAGE_SIZE - PAGE_HEADER_SIZE + 1), 2);
        assert_eq!(PageRef::pages_for(3 * PAGE_SIZE), 4);
    }

    #[test]
    fn test_page_ref_geometry() {
        let run = PageRef::overflow(10, 3);
        assert_eq!(run.end(), 13);
        assert_eq!(run.byte_len(), 3 * PAGE_SIZE);
        assert_eq!(run.file_offset(), 10 * PAGE_SIZE as u64);
        assert!(run.contains(12));
        assert!(!run.contains(13));
    }

    #[test]
    fn test_header_write_then_read() {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageHeader::overflow(77, 20_000).write(&mut buf);

        let header = PageHeader::read(&buf).unwrap();
        assert_eq!(header.page_number, 77);
        assert_eq!(header.flags, PageFlags::Overflow);
        assert_eq!(header.page_count(), 3);
    }

    #[test]
    fn test_unknown_flags_is_corruption() {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[8] = 0xEE;
        let err = PageHeader::read(&buf).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_single_page_count_ignores_size() {
        let header = PageHeader::new(5, PageFlags::Single);
        assert_eq!(header.page_count(), 1);
    }
}
