//! Memory-mapped data file
//!
//! The pager owns the data file and its mapping. All access is by page
//! number and bounds-checked; callers get owned copies on read so that a
//! later `grow()` remap can never leave a dangling slice behind.
//!
//! Only the flusher and recovery write through the pager. Transactions
//! never do: their pages reach the data file by way of the journal.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::errors::{StorageError, StorageResult};
use super::header::{FileHeader, HEADER_PAGE};
use super::page::{PageNumber, PageRef, PAGE_SIZE};

/// Grow by at most this many pages at once (1 GiB)
const MAX_GROW_PAGES: u64 = (1024 * 1024 * 1024) / PAGE_SIZE as u64;

/// Smallest data file created
pub const MIN_INITIAL_PAGES: u64 = 2;

/// Header and allocated page count of a data file, read without mapping
/// or locking it. Nothing is created when the file is missing.
pub fn read_file_header(path: &Path) -> StorageResult<(FileHeader, u64)> {
    let mut file = File::open(path)
        .map_err(|e| StorageError::io(format!("failed to open data file '{}'", path.display()), e))?;
    let len = file
        .metadata()
        .map_err(|e| StorageError::io("failed to read data file metadata", e))?
        .len();
    if len < PAGE_SIZE as u64 || len % PAGE_SIZE as u64 != 0 {
        return Err(StorageError::invalid_format(format!(
            "data file '{}' size {} is not a multiple of page size {}",
            path.display(),
            len,
            PAGE_SIZE
        )));
    }

    let mut page = vec![0u8; PAGE_SIZE];
    file.read_exact(&mut page)
        .map_err(|e| StorageError::io("failed to read data file header", e))?;
    Ok((FileHeader::read(&page)?, len / PAGE_SIZE as u64))
}

#[derive(Debug)]
pub struct Pager {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    allocated_pages: u64,
}

impl Pager {
    /// Opens the data file, creating and initializing it when missing or empty.
    pub fn open(path: &Path, initial_pages: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                StorageError::io(format!("failed to open data file '{}'", path.display()), e)
            })?;

        let len = file
            .metadata()
            .map_err(|e| StorageError::io("failed to read data file metadata", e))?
            .len();

        let fresh = len == 0;
        if fresh {
            let pages = initial_pages.max(MIN_INITIAL_PAGES);
            file.set_len(pages * PAGE_SIZE as u64).map_err(|e| {
                StorageError::io(format!("failed to size new data file to {} pages", pages), e)
            })?;
        } else if len % PAGE_SIZE as u64 != 0 {
            return Err(StorageError::invalid_format(format!(
                "data file '{}' size {} is not a multiple of page size {}",
                path.display(),
                len,
                PAGE_SIZE
            )));
        }

        // SAFETY: the data file is opened read+write by this process only and
        // is not modified externally. The mapping lives as long as the pager
        // and every access goes through bounds-checked page accessors.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            StorageError::io(format!("failed to memory-map '{}'", path.display()), e)
        })?;

        let allocated_pages = mmap.len() as u64 / PAGE_SIZE as u64;
        let mut pager = Self {
            path: path.to_path_buf(),
            file,
            mmap,
            allocated_pages,
        };

        if fresh {
            let mut header_page = vec![0u8; PAGE_SIZE];
            FileHeader::new().write(&mut header_page);
            pager.write_pages(HEADER_PAGE, &header_page)?;
            pager.sync()?;
        } else {
            pager.read_header()?;
        }

        Ok(pager)
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages backed by the file (allocated, not necessarily used)
    pub fn number_of_allocated_pages(&self) -> u64 {
        self.allocated_pages
    }

    /// Size of the data file in bytes
    pub fn file_size(&self) -> u64 {
        self.allocated_pages * PAGE_SIZE as u64
    }

    /// Parse the header page as currently stored in the data file
    pub fn read_header(&self) -> StorageResult<FileHeader> {
        let page = self.read_pages(PageRef::single(HEADER_PAGE))?;
        FileHeader::read(&page)
    }

    /// Copy a run of pages out of the file
    pub fn read_pages(&self, page_ref: PageRef) -> StorageResult<Vec<u8>> {
        self.check_bounds(page_ref)?;
        let start = page_ref.file_offset() as usize;
        Ok(self.mmap[start..start + page_ref.byte_len()].to_vec())
    }

    /// Write whole pages starting at `page_number`, growing the file if needed
    pub fn write_pages(&mut self, page_number: PageNumber, bytes: &[u8]) -> StorageResult<()> {
        if bytes.is_empty() || bytes.len() % PAGE_SIZE != 0 {
            return Err(StorageError::corruption_at_page(
                page_number,
                format!("write of {} bytes is not page aligned", bytes.len()),
            ));
        }
        let count = (bytes.len() / PAGE_SIZE) as u64;
        self.ensure_capacity(page_number + count)?;

        let start = (page_number * PAGE_SIZE as u64) as usize;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Make sure the file backs at least `pages` pages
    pub fn ensure_capacity(&mut self, pages: u64) -> StorageResult<()> {
        if pages <= self.allocated_pages {
            return Ok(());
        }

        let step = self.allocated_pages.clamp(1, MAX_GROW_PAGES);
        let new_pages = pages.max(self.allocated_pages + step);
        let new_size = new_pages * PAGE_SIZE as u64;

        self.mmap
            .flush()
            .map_err(|e| StorageError::io("failed to flush mapping before grow", e))?;
        self.file.set_len(new_size).map_err(|e| {
            StorageError::io(format!("failed to extend data file to {} bytes", new_size), e)
        })?;

        // SAFETY: `&mut self` guarantees no slice into the old mapping is
        // alive; the old mapping was flushed above and is dropped on assignment.
        self.mmap = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| StorageError::io("failed to remap data file after grow", e))?;
        self.allocated_pages = new_pages;
        Ok(())
    }

    /// Flush the mapping and file metadata to disk
    pub fn sync(&self) -> StorageResult<()> {
        self.mmap
            .flush()
            .map_err(|e| StorageError::io("failed to msync data file", e))?;
        self.file
            .sync_all()
            .map_err(|e| StorageError::io("failed to fsync data file", e))
    }

    fn check_bounds(&self, page_ref: PageRef) -> StorageResult<()> {
        if page_ref.count == 0 || page_ref.end() > self.allocated_pages {
            return Err(StorageError::out_of_bounds(
                page_ref.number,
                page_ref.count,
                self.allocated_pages,
            ));
        }
        Ok(())
    }
}
