//! Journal transaction records
//!
//! Each committed transaction is one record, aligned to 4 KiB units:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic
//! 4       4     page_count
//! 8       8     journal_number
//! 16      8     tx_id
//! 24      8     payload_len
//! 32      4     payload_crc
//! 36      4     header_crc (over bytes 0..36)
//! 40      N     payload: page entries
//! ```
//!
//! Page entry: `page_number u64 | page_span u32 | len u32 | bytes[len]`.
//!
//! The journal number is part of the record so that stale records left in a
//! recycled file are never mistaken for live ones.

use std::sync::Arc;

use crate::storage::{
    compute_checksum, read_u32, read_u64, write_u32, write_u64, PageNumber, PageRef, PAGE_SIZE,
};

use super::errors::{JournalError, JournalResult};

/// Journal records and file headers are laid out in units of this size
pub const UNIT_SIZE: usize = 4096;

/// Fixed record header length
pub const RECORD_HEADER_SIZE: usize = 40;

const RECORD_MAGIC: u32 = 0x5854_4A41; // "AJTX"
const ENTRY_HEADER_SIZE: usize = 16;

/// One page run written by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEntry {
    pub page_number: PageNumber,
    pub page_span: u32,
    pub bytes: Arc<[u8]>,
}

impl PageEntry {
    pub fn new(page_ref: PageRef, bytes: Arc<[u8]>) -> Self {
        Self {
            page_number: page_ref.number,
            page_span: page_ref.count,
            bytes,
        }
    }

    pub fn page_ref(&self) -> PageRef {
        PageRef::overflow(self.page_number, self.page_span)
    }
}

/// The full dirty set of one committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalTransaction {
    pub tx_id: u64,
    pub pages: Vec<PageEntry>,
}

/// Parsed fixed header of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub page_count: u32,
    pub journal_number: u64,
    pub tx_id: u64,
    pub payload_len: u64,
    pub payload_crc: u32,
}

impl RecordHeader {
    /// Parse a record header. Returns None for anything that is not a valid
    /// header: zeroed space, a torn write or garbage.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_HEADER_SIZE || read_u32(buf, 0) != RECORD_MAGIC {
            return None;
        }
        if compute_checksum(&buf[..36]) != read_u32(buf, 36) {
            return None;
        }
        Some(Self {
            page_count: read_u32(buf, 4),
            journal_number: read_u64(buf, 8),
            tx_id: read_u64(buf, 16),
            payload_len: read_u64(buf, 24),
            payload_crc: read_u32(buf, 32),
        })
    }

    /// Whole record length including padding to the unit size
    pub fn record_len(&self) -> u64 {
        aligned_len(RECORD_HEADER_SIZE as u64 + self.payload_len)
    }
}

impl JournalTransaction {
    pub fn new(tx_id: u64, pages: Vec<PageEntry>) -> Self {
        Self { tx_id, pages }
    }

    /// Bytes of the page entries
    pub fn payload_len(&self) -> u64 {
        self.pages
            .iter()
            .map(|p| (ENTRY_HEADER_SIZE + p.bytes.len()) as u64)
            .sum()
    }

    /// Length of the encoded record, padded to whole units
    pub fn encoded_len(&self) -> u64 {
        aligned_len(RECORD_HEADER_SIZE as u64 + self.payload_len())
    }

    /// Encode into a unit-aligned buffer tagged with `journal_number`
    pub fn encode(&self, journal_number: u64) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len() as usize];

        let mut offset = RECORD_HEADER_SIZE;
        for page in &self.pages {
            write_u64(&mut buf, offset, page.page_number);
            write_u32(&mut buf, offset + 8, page.page_span);
            write_u32(&mut buf, offset + 12, page.bytes.len() as u32);
            offset += ENTRY_HEADER_SIZE;
            buf[offset..offset + page.bytes.len()].copy_from_slice(&page.bytes);
            offset += page.bytes.len();
        }
        let payload_crc = compute_checksum(&buf[RECORD_HEADER_SIZE..offset]);

        write_u32(&mut buf, 0, RECORD_MAGIC);
        write_u32(&mut buf, 4, self.pages.len() as u32);
        write_u64(&mut buf, 8, journal_number);
        write_u64(&mut buf, 16, self.tx_id);
        write_u64(&mut buf, 24, (offset - RECORD_HEADER_SIZE) as u64);
        write_u32(&mut buf, 32, payload_crc);
        let header_crc = compute_checksum(&buf[..36]);
        write_u32(&mut buf, 36, header_crc);
        buf
    }

    /// Decode a payload whose header has already been validated.
    ///
    /// Returns None when the payload checksum does not match.
    pub fn decode(header: &RecordHeader, payload: &[u8]) -> JournalResult<Option<Self>> {
        if payload.len() as u64 != header.payload_len {
            return Ok(None);
        }
        if compute_checksum(payload) != header.payload_crc {
            return Ok(None);
        }

        // The checksum matched, so any structural problem past this point is
        // a record that was written wrong, not a torn write.
        let mut pages = Vec::with_capacity(header.page_count as usize);
        let mut offset = 0usize;
        for _ in 0..header.page_count {
            if offset + ENTRY_HEADER_SIZE > payload.len() {
                return Err(JournalError::corruption(format!(
                    "transaction {} entry header past payload end",
                    header.tx_id
                )));
            }
            let page_number = read_u64(payload, offset);
            let page_span = read_u32(payload, offset + 8);
            let len = read_u32(payload, offset + 12) as usize;
            offset += ENTRY_HEADER_SIZE;

            if page_span == 0 || len != page_span as usize * PAGE_SIZE {
                return Err(JournalError::corruption(format!(
                    "transaction {} page {} has span {} but {} bytes",
                    header.tx_id, page_number, page_span, len
                )));
            }
            if offset + len > payload.len() {
                return Err(JournalError::corruption(format!(
                    "transaction {} page {} past payload end",
                    header.tx_id, page_number
                )));
            }

            pages.push(PageEntry {
                page_number,
                page_span,
                bytes: Arc::from(&payload[offset..offset + len]),
            });
            offset += len;
        }

        Ok(Some(Self {
            tx_id: header.tx_id,
            pages,
        }))
    }
}

/// Round `len` up to whole units
pub fn aligned_len(len: u64) -> u64 {
    let unit = UNIT_SIZE as u64;
    len.div_ceil(unit) * unit
}
