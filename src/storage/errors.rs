//! Page store error types
//!
//! Error codes:
//! - AERO_STORAGE_IO (ERROR severity)
//! - AERO_STORAGE_OUT_OF_BOUNDS (ERROR severity)
//! - AERO_STORAGE_CORRUPTION (FATAL severity)
//! - AERO_STORAGE_INVALID_FORMAT (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels shared by the storage and journal layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, engine continues
    Error,
    /// On-disk state can no longer be trusted
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Page store error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// Disk or mapping I/O failure
    AeroStorageIo,
    /// Page access outside the mapped file
    AeroStorageOutOfBounds,
    /// Page reference that does not match what is stored (wrong span,
    /// unallocated run)
    AeroStorageInvalidPageRef,
    /// Page content failed validation
    AeroStorageCorruption,
    /// Data file is not an aerostore file, or has an unsupported layout
    AeroStorageInvalidFormat,
}

impl StorageErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::AeroStorageIo => "AERO_STORAGE_IO",
            StorageErrorCode::AeroStorageOutOfBounds => "AERO_STORAGE_OUT_OF_BOUNDS",
            StorageErrorCode::AeroStorageInvalidPageRef => "AERO_STORAGE_INVALID_PAGE_REF",
            StorageErrorCode::AeroStorageCorruption => "AERO_STORAGE_CORRUPTION",
            StorageErrorCode::AeroStorageInvalidFormat => "AERO_STORAGE_INVALID_FORMAT",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::AeroStorageIo => Severity::Error,
            StorageErrorCode::AeroStorageOutOfBounds => Severity::Error,
            StorageErrorCode::AeroStorageInvalidPageRef => Severity::Error,
            StorageErrorCode::AeroStorageCorruption => Severity::Fatal,
            StorageErrorCode::AeroStorageInvalidFormat => Severity::Fatal,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Page store error with code, context and optional I/O source
#[derive(Debug)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl StorageError {
    /// I/O failure while reading, writing, mapping or syncing the data file
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: StorageErrorCode::AeroStorageIo,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    /// Page range outside the allocated file
    pub fn out_of_bounds(first_page: u64, count: u32, allocated: u64) -> Self {
        Self {
            code: StorageErrorCode::AeroStorageOutOfBounds,
            message: format!("page range {}+{} out of bounds", first_page, count),
            details: Some(format!("allocated_pages: {}", allocated)),
            source: None,
        }
    }

    /// A caller asked for a page run that does not exist as given
    pub fn invalid_page_ref(page_number: u64, reason: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::AeroStorageInvalidPageRef,
            message: reason.into(),
            details: Some(format!("page_number: {}", page_number)),
            source: None,
        }
    }

    /// Page content failed validation
    pub fn corruption(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::AeroStorageCorruption,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Page content failed validation at a known page
    pub fn corruption_at_page(page_number: u64, reason: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::AeroStorageCorruption,
            message: reason.into(),
            details: Some(format!("page_number: {}", page_number)),
            source: None,
        }
    }

    /// File layout not recognized
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::AeroStorageInvalidFormat,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> StorageErrorCode {
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

impl fmt::Display for StorageError {
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

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for page store operations
pub type StorageResult<T> = Result<T, StorageError>;
