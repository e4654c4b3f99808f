//! Flush marker file handling
//!
//! The flush marker records how far journaled transactions have been
//! applied to the data file:
//! - last_flushed_transaction: highest transaction id durable in the data file
//! - last_flushed_journal: journal that recorded it (0 when none)
//! - updated_at: RFC3339 timestamp
//! - format_version: always 1
//!
//! Location: `<data_dir>/flush.json`
//!
//! The marker is written only after the data file has been synced, and
//! before any journal it covers is recycled. It is replaced atomically
//! through a temp file, fsync and rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::errors::{JournalError, JournalResult};

const MARKER_FILE: &str = "flush.json";
const MARKER_TEMP_FILE: &str = "flush.json.tmp";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlushMarker {
    pub last_flushed_transaction: u64,
    pub last_flushed_journal: u64,
    pub updated_at: String,
    pub format_version: u8,
}

impl FlushMarker {
    /// Marker of a store where nothing has been flushed yet
    pub fn initial() -> Self {
        Self::new(0, 0)
    }

    pub fn new(last_flushed_transaction: u64, last_flushed_journal: u64) -> Self {
        Self {
            last_flushed_transaction,
            last_flushed_journal,
            updated_at: Utc::now().to_rfc3339(),
            format_version: 1,
        }
    }

    pub fn to_json(&self) -> JournalResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| JournalError::marker_failed("failed to serialize flush marker", e))
    }

    pub fn from_json(json: &str) -> JournalResult<Self> {
        let marker: Self = serde_json::from_str(json)
            .map_err(|e| JournalError::marker_failed("failed to parse flush marker", e))?;
        if marker.format_version != 1 {
            return Err(JournalError::corruption(format!(
                "unsupported flush marker version {}",
                marker.format_version
            )));
        }
        Ok(marker)
    }

    /// Write the marker durably, replacing any previous one
    pub fn write_to_dir(&self, data_dir: &Path) -> JournalResult<()> {
        let json = self.to_json()?;
        let temp = data_dir.join(MARKER_TEMP_FILE);
        let target = marker_path(data_dir);

        let mut file = File::create(&temp).map_err(|e| {
            JournalError::marker_failed(format!("failed to create {}", temp.display()), e)
        })?;
        file.write_all(json.as_bytes()).map_err(|e| {
            JournalError::marker_failed(format!("failed to write {}", temp.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            JournalError::marker_failed(format!("failed to fsync {}", temp.display()), e)
        })?;
        drop(file);

        fs::rename(&temp, &target).map_err(|e| {
            JournalError::marker_failed(format!("failed to install {}", target.display()), e)
        })?;

        let dir = OpenOptions::new().read(true).open(data_dir).map_err(|e| {
            JournalError::marker_failed(
                format!("failed to open {} for fsync", data_dir.display()),
                e,
            )
        })?;
        dir.sync_all().map_err(|e| {
            JournalError::marker_failed(format!("failed to fsync {}", data_dir.display()), e)
        })
    }

    /// Read the marker, or the initial marker when none was written yet
    pub fn read_from_dir(data_dir: &Path) -> JournalResult<Self> {
        let path = marker_path(data_dir);
        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::initial()),
            Err(e) => Err(JournalError::marker_failed(
                format!("failed to read {}", path.display()),
                e,
            )),
        }
    }
}

/// Path of the flush marker in `data_dir`
pub fn marker_path(data_dir: &Path) -> PathBuf {
    data_dir.join(MARKER_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_marker_is_initial() {
        let dir = TempDir::new().unwrap();
        let marker = FlushMarker::read_from_dir(dir.path()).unwrap();
        assert_eq!(marker.last_flushed_transaction, 0);
        assert_eq!(marker.last_flushed_journal, 0);
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let marker = FlushMarker::new(42, 3);
        marker.write_to_dir(dir.path()).unwrap();

        let read = FlushMarker::read_from_dir(dir.path()).unwrap();
        assert_eq!(read, marker);
        assert!(!dir.path().join(MARKER_TEMP_FILE).exists());
    }

    #[test]
    fn test_json_field_names() {
        let json = FlushMarker::new(7, 1).to_json().unwrap();
        assert!(json.contains("\"last_flushed_transaction\": 7"));
        assert!(json.contains("\"last_flushed_journal\": 1"));
        assert!(json.contains("\"format_version\": 1"));
    }

    #[test]
    fn test_updated_at_is_rfc3339() {
        let marker = FlushMarker::new(1, 1);
        assert!(chrono::DateTime::parse_from_rfc3339(&marker.updated_at).is_ok());
    }

    #[test]
    fn test_garbage_marker_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(marker_path(dir.path()), "not json").unwrap();
        assert!(FlushMarker::read_from_dir(dir.path()).is_err());
    }
}
