//! Journal error types
//!
//! Error codes:
//! - AERO_JOURNAL_APPEND_FAILED (ERROR severity)
//! - AERO_JOURNAL_FSYNC_FAILED (FATAL severity)
//! - AERO_JOURNAL_CORRUPTION (FATAL severity)
//! - AERO_JOURNAL_REPLAY_FAILED (FATAL severity)
//! - AERO_JOURNAL_MARKER_FAILED (ERROR severity)

use std::fmt;
use std::io;

use crate::storage::{Severity, StorageError};

/// Journal error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalErrorCode {
    /// Journal write failed
    AeroJournalAppendFailed,
    /// Journal fsync failed
    AeroJournalFsyncFailed,
    /// Journal content failed validation
    AeroJournalCorruption,
    /// Replayed pages could not be written to the data file
    AeroJournalReplayFailed,
    /// Flush marker could not be read or written
    AeroJournalMarkerFailed,
}

impl JournalErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            JournalErrorCode::AeroJournalAppendFailed => "AERO_JOURNAL_APPEND_FAILED",
            JournalErrorCode::AeroJournalFsyncFailed => "AERO_JOURNAL_FSYNC_FAILED",
            JournalErrorCode::AeroJournalCorruption => "AERO_JOURNAL_CORRUPTION",
            JournalErrorCode::AeroJournalReplayFailed => "AERO_JOURNAL_REPLAY_FAILED",
            JournalErrorCode::AeroJournalMarkerFailed => "AERO_JOURNAL_MARKER_FAILED",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            JournalErrorCode::AeroJournalAppendFailed => Severity::Error,
            JournalErrorCode::AeroJournalFsyncFailed => Severity::Fatal,
            JournalErrorCode::AeroJournalCorruption => Severity::Fatal,
            JournalErrorCode::AeroJournalReplayFailed => Severity::Fatal,
            JournalErrorCode::AeroJournalMarkerFailed => Severity::Error,
        }
    }
}

impl fmt::Display for JournalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Journal error with code, context and optional source
#[derive(Debug)]
pub struct JournalError {
    code: JournalErrorCode,
    message: String,
    details: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl JournalError {
    /// Writing a record or file header failed
    pub fn append_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalAppendFailed,
            message: message.into(),
            details: None,
            source: Some(Box::new(source)),
        }
    }

    /// fsync of a journal file failed
    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalFsyncFailed,
            message: message.into(),
            details: None,
            source: Some(Box::new(source)),
        }
    }

    /// Journal content is not valid
    pub fn corruption(message: impl Into<String>) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalCorruption,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Journal content is not valid at a known position
    pub fn corruption_at(journal: u64, offset: u64, reason: impl Into<String>) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalCorruption,
            message: reason.into(),
            details: Some(format!("journal: {}, byte_offset: {}", journal, offset)),
            source: None,
        }
    }

    /// Reading a journal file failed
    pub fn read_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalCorruption,
            message: message.into(),
            details: None,
            source: Some(Box::new(source)),
        }
    }

    /// Applying replayed pages to the data file failed
    pub fn replay_failed(tx_id: u64, source: StorageError) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalReplayFailed,
            message: format!("failed to apply transaction {}", tx_id),
            details: Some(source.to_string()),
            source: Some(Box::new(source)),
        }
    }

    /// Flush marker I/O or parse failure
    pub fn marker_failed(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code: JournalErrorCode::AeroJournalMarkerFailed,
            message: message.into(),
            details: None,
            source: Some(Box::new(source)),
        }
    }

    /// Returns the error code
    pub fn code(&self) -> JournalErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type for journal operations
pub type JournalResult<T> = Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            JournalErrorCode::AeroJournalAppendFailed.code(),
            "AERO_JOURNAL_APPEND_FAILED"
        );
        assert_eq!(
            JournalErrorCode::AeroJournalFsyncFailed.code(),
            "AERO_JOURNAL_FSYNC_FAILED"
        );
        assert_eq!(
            JournalErrorCode::AeroJournalCorruption.code(),
            "AERO_JOURNAL_CORRUPTION"
        );
    }

    #[test]
    fn test_severities() {
        let io_err = || io::Error::new(io::ErrorKind::Other, "disk");
        assert!(!JournalError::append_failed("write", io_err()).is_fatal());
        assert!(JournalError::fsync_failed("sync", io_err()).is_fatal());
        assert!(JournalError::corruption("bad crc").is_fatal());
        assert!(JournalError::replay_failed(3, StorageError::corruption("x")).is_fatal());
    }

    #[test]
    fn test_display_with_position() {
        let err = JournalError::corruption_at(7, 8192, "record checksum mismatch");
        let display = err.to_string();
        assert!(display.contains("AERO_JOURNAL_CORRUPTION"));
        assert!(display.contains("journal: 7"));
        assert!(display.contains("byte_offset: 8192"));
    }
}
