//! Journal files
//!
//! Live journals are named `<number:019>.journal`; files kept for reuse after
//! flush are named `recyclable.<number:019>.journal`. Every file starts with
//! a one-unit header:
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic "AEROJRNL"
//! 8       4     format version
//! 12      4     reserved
//! 16      8     journal number
//! 24      8     allocated 4 KiB units (header included)
//! 32      4     CRC32 over bytes 0..32
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::storage::{compute_checksum, read_u32, read_u64, write_u32, write_u64};

use super::errors::{JournalError, JournalResult};
use super::record::{aligned_len, UNIT_SIZE};

const FILE_MAGIC: &[u8; 8] = b"AEROJRNL";
const FILE_VERSION: u32 = 1;
const JOURNAL_EXTENSION: &str = "journal";
const RECYCLABLE_PREFIX: &str = "recyclable.";

/// Read-only view of a journal file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalSnapshot {
    pub number: u64,
    /// Unwritten 4 KiB units left in the file
    pub available_4kbs: u64,
    /// Last transaction recorded in the file, 0 when empty
    pub last_transaction: u64,
    pub allocated_bytes: u64,
}

/// Path of live journal `number`
pub fn journal_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:019}.{}", number, JOURNAL_EXTENSION))
}

/// Path of recyclable journal `number`
pub fn recyclable_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{}{:019}.{}", RECYCLABLE_PREFIX, number, JOURNAL_EXTENSION))
}

/// Journal files found in a directory
#[derive(Debug, Default)]
pub struct JournalListing {
    /// Live journal numbers, ascending
    pub live: Vec<u64>,
    /// Recyclable file numbers, ascending
    pub recyclable: Vec<u64>,
}

/// List live and recyclable journals in `dir`; a missing directory is empty.
pub fn list_journals(dir: &Path) -> JournalResult<JournalListing> {
    let mut listing = JournalListing::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
        Err(e) => {
            return Err(JournalError::read_failed(
                format!("failed to list journal directory {}", dir.display()),
                e,
            ))
        }
    };

    for entry in entries {
        let entry = entry.map_err(|e| JournalError::read_failed("failed to read directory entry", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".journal") else { continue };

        if let Some(number) = stem.strip_prefix(RECYCLABLE_PREFIX) {
            if let Ok(n) = number.parse::<u64>() {
                listing.recyclable.push(n);
            }
        } else if let Ok(n) = stem.parse::<u64>() {
            listing.live.push(n);
        }
    }

    listing.live.sort_unstable();
    listing.recyclable.sort_unstable();
    Ok(listing)
}

/// Parsed journal file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalFileHeader {
    pub number: u64,
    pub allocated_4kbs: u64,
}

impl JournalFileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; UNIT_SIZE];
        buf[..8].copy_from_slice(FILE_MAGIC);
        write_u32(&mut buf, 8, FILE_VERSION);
        write_u64(&mut buf, 16, self.number);
        write_u64(&mut buf, 24, self.allocated_4kbs);
        let crc = compute_checksum(&buf[..32]);
        write_u32(&mut buf, 32, crc);
        buf
    }

    /// Parse a header unit. `Ok(None)` means the header was never written.
    pub fn decode(buf: &[u8]) -> JournalResult<Option<Self>> {
        if buf.len() < 36 || buf[..36].iter().all(|b| *b == 0) {
            return Ok(None);
        }
        if &buf[..8] != FILE_MAGIC {
            return Err(JournalError::corruption("bad journal file magic"));
        }
        if compute_checksum(&buf[..32]) != read_u32(buf, 32) {
            return Err(JournalError::corruption("journal file header checksum mismatch"));
        }
        let version = read_u32(buf, 8);
        if version != FILE_VERSION {
            return Err(JournalError::corruption(format!(
                "unsupported journal format version {}",
                version
            )));
        }
        Ok(Some(Self {
            number: read_u64(buf, 16),
            allocated_4kbs: read_u64(buf, 24),
        }))
    }
}

/// An open journal file being appended to
#[derive(Debug)]
pub struct JournalFile {
    number: u64,
    path: PathBuf,
    file: File,
    allocated_4kbs: u64,
    /// Next unit to write; unit 0 is the file header
    write_unit: u64,
    last_transaction: u64,
}

impl JournalFile {
    /// Create journal `number` with room for at least `size_bytes`.
    ///
    /// When `reuse` names a recyclable file it is renamed into place instead
    /// of allocating a new one.
    pub fn create(
        dir: &Path,
        number: u64,
        size_bytes: u64,
        reuse: Option<&Path>,
    ) -> JournalResult<Self> {
        let path = journal_path(dir, number);
        if let Some(old) = reuse {
            fs::rename(old, &path).map_err(|e| {
                JournalError::append_failed(
                    format!("failed to reuse {} as journal {}", old.display(), number),
                    e,
                )
            })?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                JournalError::append_failed(format!("failed to open journal {}", path.display()), e)
            })?;

        let size = aligned_len(size_bytes.max(2 * UNIT_SIZE as u64));
        let current = file
            .metadata()
            .map_err(|e| JournalError::append_failed("failed to read journal metadata", e))?
            .len();
        let size = size.max(aligned_len(current));
        if current != size {
            file.set_len(size).map_err(|e| {
                JournalError::append_failed(format!("failed to size journal {}", number), e)
            })?;
        }

        let allocated_4kbs = size / UNIT_SIZE as u64;
        let header = JournalFileHeader {
            number,
            allocated_4kbs,
        };
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header.encode()))
            .map_err(|e| {
                JournalError::append_failed(format!("failed to write header of journal {}", number), e)
            })?;
        file.sync_all().map_err(|e| {
            JournalError::fsync_failed(format!("failed to fsync new journal {}", number), e)
        })?;
        sync_dir(dir)?;

        Ok(Self {
            number,
            path,
            file,
            allocated_4kbs,
            write_unit: 1,
            last_transaction: 0,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_transaction(&self) -> u64 {
        self.last_transaction
    }

    pub fn available_4kbs(&self) -> u64 {
        self.allocated_4kbs - self.write_unit
    }

    /// Whether an encoded record of `len` bytes fits the unwritten space
    pub fn fits(&self, len: u64) -> bool {
        len / UNIT_SIZE as u64 <= self.available_4kbs()
    }

    /// Write an encoded, unit-aligned record at the write position
    pub fn write_record(&mut self, tx_id: u64, record: &[u8]) -> JournalResult<()> {
        let offset = self.write_unit * UNIT_SIZE as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(record))
            .map_err(|e| {
                JournalError::append_failed(
                    format!(
                        "failed to append transaction {} to journal {}",
                        tx_id, self.number
                    ),
                    e,
                )
            })?;
        self.write_unit += record.len() as u64 / UNIT_SIZE as u64;
        self.last_transaction = tx_id;
        Ok(())
    }

    pub fn sync(&self) -> JournalResult<()> {
        self.file.sync_data().map_err(|e| {
            JournalError::fsync_failed(format!("failed to fsync journal {}", self.number), e)
        })
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            number: self.number,
            available_4kbs: self.available_4kbs(),
            last_transaction: self.last_transaction,
            allocated_bytes: self.allocated_4kbs * UNIT_SIZE as u64,
        }
    }
}

/// fsync a directory so renames and creations are durable
pub fn sync_dir(dir: &Path) -> JournalResult<()> {
    let handle = OpenOptions::new().read(true).open(dir).map_err(|e| {
        JournalError::fsync_failed(format!("failed to open {} for fsync", dir.display()), e)
    })?;
    handle.sync_all().map_err(|e| {
        JournalError::fsync_failed(format!("failed to fsync directory {}", dir.display()), e)
    })
}
