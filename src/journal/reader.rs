//! Sequential journal reader
//!
//! Reads the transaction records of one journal file in order. The valid
//! log ends at the first unit that does not hold a complete, checksummed
//! record of this journal: zeroed space, a torn write, or a stale record left
//! in a recycled file. A record whose transaction id does not increase is
//! corruption.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use super::errors::{JournalError, JournalResult};
use super::file::{JournalFileHeader, JournalSnapshot};
use super::record::{JournalTransaction, RecordHeader, RECORD_HEADER_SIZE, UNIT_SIZE};

pub struct JournalReader {
    file: File,
    number: u64,
    allocated_4kbs: u64,
    next_unit: u64,
    last_tx_id: u64,
    ended: bool,
}

impl JournalReader {
    /// Open a journal file for reading.
    ///
    /// A file whose header was never written reads as an empty journal.
    pub fn open(path: &Path, expected_number: u64) -> JournalResult<Self> {
        let mut file = File::open(path).map_err(|e| {
            JournalError::read_failed(format!("failed to open journal {}", path.display()), e)
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| JournalError::read_failed("failed to read journal metadata", e))?
            .len();

        let mut unit = vec![0u8; UNIT_SIZE];
        let header = match read_exact_or_eof(&mut file, &mut unit) {
            Ok(true) => JournalFileHeader::decode(&unit)?,
            Ok(false) => None,
            Err(e) => {
                return Err(JournalError::read_failed(
                    format!("failed to read header of {}", path.display()),
                    e,
                ))
            }
        };

        let (allocated_4kbs, ended) = match header {
            Some(h) if h.number != expected_number => {
                return Err(JournalError::corruption(format!(
                    "journal {} has header number {}",
                    expected_number, h.number
                )))
            }
            Some(h) => (h.allocated_4kbs.min(file_len / UNIT_SIZE as u64), false),
            None => (file_len / UNIT_SIZE as u64, true),
        };

        Ok(Self {
            file,
            number: expected_number,
            allocated_4kbs,
            next_unit: 1,
            last_tx_id: 0,
            ended,
        })
    }

    /// Read the next committed transaction, or None at the end of the log
    pub fn read_next(&mut self) -> JournalResult<Option<JournalTransaction>> {
        if self.ended || self.next_unit >= self.allocated_4kbs {
            self.ended = true;
            return Ok(None);
        }

        let offset = self.next_unit * UNIT_SIZE as u64;
        let mut head = [0u8; RECORD_HEADER_SIZE];
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| JournalError::read_failed("failed to seek journal", e))?;
        if !read_exact_or_eof(&mut self.file, &mut head)
            .map_err(|e| JournalError::read_failed("failed to read record header", e))?
        {
            return Ok(self.end());
        }

        let header = match RecordHeader::parse(&head) {
            Some(h) if h.journal_number == self.number => h,
            _ => return Ok(self.end()),
        };

        let record_units = header.record_len() / UNIT_SIZE as u64;
        if self.next_unit + record_units > self.allocated_4kbs {
            return Ok(self.end());
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        if !read_exact_or_eof(&mut self.file, &mut payload)
            .map_err(|e| JournalError::read_failed("failed to read record payload", e))?
        {
            return Ok(self.end());
        }

        let Some(tx) = JournalTransaction::decode(&header, &payload)? else {
            return Ok(self.end());
        };

        if tx.tx_id <= self.last_tx_id {
            return Err(JournalError::corruption_at(
                self.number,
                offset,
                format!(
                    "transaction id {} does not follow {}",
                    tx.tx_id, self.last_tx_id
                ),
            ));
        }

        self.last_tx_id = tx.tx_id;
        self.next_unit += record_units;
        Ok(Some(tx))
    }

    /// Journal number being read
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Last transaction id read so far
    pub fn last_tx_id(&self) -> u64 {
        self.last_tx_id
    }

    /// Read the whole file and describe it
    pub fn scan(path: &Path, number: u64) -> JournalResult<JournalSnapshot> {
        let mut reader = Self::open(path, number)?;
        while reader.read_next()?.is_some() {}
        Ok(JournalSnapshot {
            number,
            available_4kbs: reader.allocated_4kbs.saturating_sub(reader.next_unit),
            last_transaction: reader.last_tx_id,
            allocated_bytes: reader.allocated_4kbs * UNIT_SIZE as u64,
        })
    }

    fn end(&mut self) -> Option<JournalTransaction> {
        self.ended = true;
        None
    }
}

/// Fill `buf` completely, returning false if the file ends first
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::file::JournalFile;
    use crate::journal::record::PageEntry;
    use crate::storage::{PageRef, PAGE_SIZE};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tx(id: u64, page: u64, fill: u8) -> JournalTransaction {
        let bytes: Arc<[u8]> = Arc::from(vec![fill; PAGE_SIZE]);
        JournalTransaction::new(id, vec![PageEntry::new(PageRef::single(page), bytes)])
    }

    fn write_all(journal: &mut JournalFile, txs: &[JournalTransaction]) {
        for t in txs {
            let buf = t.encode(journal.number());
            journal.write_record(t.tx_id, &buf).unwrap();
        }
        journal.sync().unwrap();
    }

    #[test]
    fn test_reads_records_in_order() {
        let dir = TempDir::new().unwrap();
        let mut journal = JournalFile::create(dir.path(), 1, 1024 * 1024, None).unwrap();
        write_all(&mut journal, &[tx(1, 3, 1), tx(2, 4, 2), tx(3, 3, 3)]);

        let mut reader = JournalReader::open(journal.path(), 1).unwrap();
        let ids: Vec<u64> = std::iter::from_fn(|| reader.read_next().unwrap())
            .map(|t| t.tx_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_torn_tail_ends_log() {
        let dir = TempDir::new().unwrap();
        let mut journal = JournalFile::create(dir.path(), 1, 1024 * 1024, None).unwrap();
        write_all(&mut journal, &[tx(1, 3, 1), tx(2, 4, 2)]);

        // Corrupt the payload of the second record.
        let second_offset = (1 + tx(1, 3, 1).encoded_len() / UNIT_SIZE as u64) * UNIT_SIZE as u64;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(journal.path())
            .unwrap();
        file.seek(SeekFrom::Start(second_offset + 500)).unwrap();
        file.write_all(&[0xFF; 8]).unwrap();

        let snap = JournalReader::scan(journal.path(), 1).unwrap();
        assert_eq!(snap.last_transaction, 1);
    }

    #[test]
    fn test_non_increasing_tx_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut journal = JournalFile::create(dir.path(), 1, 1024 * 1024, None).unwrap();
        write_all(&mut journal, &[tx(5, 3, 1), tx(5, 4, 2)]);

        let mut reader = JournalReader::open(journal.path(), 1).unwrap();
        assert!(reader.read_next().unwrap().is_some());
        let err = reader.read_next().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stale_records_from_other_journal_ignored() {
        let dir = TempDir::new().unwrap();
        let mut journal = JournalFile::create(dir.path(), 1, 1024 * 1024, None).unwrap();
        // A record tagged with another journal number, as left by recycling.
        let stale = tx(9, 3, 1).encode(77);
        journal.write_record(9, &stale).unwrap();

        let snap = JournalReader::scan(journal.path(), 1).unwrap();
        assert_eq!(snap.last_transaction, 0);
    }

    #[test]
    fn test_unwritten_header_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0000000000000000001.journal");
        std::fs::write(&path, vec![0u8; 4 * UNIT_SIZE]).unwrap();

        let mut reader = JournalReader::open(&path, 1).unwrap();
        assert!(reader.read_next().unwrap().is_none());
    }
}
