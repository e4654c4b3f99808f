//! Structured event logger for aerostore
//!
//! Every log line is one named event plus key/value fields:
//! - Event name first, fields rendered as a JSON object
//! - Deterministic key ordering
//! - Explicit severity levels
//!
//! Lines are emitted through `tracing`, so whichever subscriber the host
//! process installs decides formatting and filtering.

use std::fmt;

use serde_json::{Map, Value};

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Debug-level detail
    Trace = 0,
    /// Normal operations
    Info = 1,
    /// Recoverable issues
    Warn = 2,
    /// Operation failures
    Error = 3,
    /// Storage can no longer be trusted
    Fatal = 4,
}

impl Severity {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event logger facade over `tracing`.
pub struct Logger;

impl Logger {
    /// Log an event with the given severity and fields
    ///
    /// Fields are rendered in deterministic order (alphabetical by key).
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        let rendered = Self::render_fields(fields);
        match severity {
            Severity::Trace => {
                tracing::trace!(target: "aerostore", event = %event, fields = %rendered)
            }
            Severity::Info => {
                tracing::info!(target: "aerostore", event = %event, fields = %rendered)
            }
            Severity::Warn => {
                tracing::warn!(target: "aerostore", event = %event, fields = %rendered)
            }
            Severity::Error => {
                tracing::error!(target: "aerostore", event = %event, fields = %rendered)
            }
            Severity::Fatal => {
                tracing::error!(target: "aerostore", event = %event, fatal = true, fields = %rendered)
            }
        }
    }

    /// Render fields as a compact JSON object with sorted keys.
    ///
    /// Later duplicates of a key win.
    pub fn render_fields(fields: &[(&str, &str)]) -> String {
        // serde_json's default map is ordered by key
        let mut map = Map::new();
        for (key, value) in fields {
            map.insert((*key).to_string(), Value::String((*value).to_string()));
        }
        Value::Object(map).to_string()
    }

    /// Log at TRACE level
    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    /// Log at INFO level
    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    /// Log at WARN level
    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    /// Log at ERROR level
    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    /// Log at FATAL level
    pub fn fatal(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Fatal, event, fields);
    }
}
