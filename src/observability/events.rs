//! Observable lifecycle events of the storage engine
//!
//! Events are explicit and typed; the string form is what lands in logs.

use std::fmt;

/// Observable events in aerostore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Environment lifecycle
    /// Storage environment is opening
    EnvOpen,
    /// Storage environment ready for transactions
    EnvReady,
    /// Storage environment closed
    EnvClosed,

    // Configuration
    /// Configuration loaded and validated
    ConfigLoaded,

    // Journal
    /// Transaction appended to the journal
    JournalAppend,
    /// Journal switched to a new file
    JournalRotate,
    /// Journal synced to disk
    JournalSync,
    /// Journal file recycled or deleted after flush
    JournalRecycled,
    /// Journal corruption detected
    JournalCorruption,

    // Flush
    /// Journaled pages applied to the data file
    FlushComplete,
    /// Flush attempt failed (will be retried)
    FlushFailed,

    // Recovery
    /// Recovery started
    RecoveryStart,
    /// Recovery finished
    RecoveryComplete,
    /// Recovery failed
    RecoveryFailed,

    // Merger
    /// Writer loop started
    MergerStarted,
    /// Writer loop stopped
    MergerStopped,
    /// Merged transaction committed
    BatchCommitted,
    /// Merged transaction failed as a whole
    BatchFailed,
    /// Command scheduled for another attempt after a conflict
    CommandRetried,
    /// Command rejected for violating the command contract
    CommandRejected,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::EnvOpen => "ENV_OPEN_BEGIN",
            Event::EnvReady => "ENV_READY",
            Event::EnvClosed => "ENV_CLOSED",

            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::JournalAppend => "JOURNAL_APPEND",
            Event::JournalRotate => "JOURNAL_ROTATE",
            Event::JournalSync => "JOURNAL_SYNC",
            Event::JournalRecycled => "JOURNAL_RECYCLED",
            Event::JournalCorruption => "JOURNAL_CORRUPTION",

            Event::FlushComplete => "FLUSH_COMPLETE",
            Event::FlushFailed => "FLUSH_FAILED",

            Event::RecoveryStart => "RECOVERY_BEGIN",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",

            Event::MergerStarted => "MERGER_STARTED",
            Event::MergerStopped => "MERGER_STOPPED",
            Event::BatchCommitted => "BATCH_COMMITTED",
            Event::BatchFailed => "BATCH_FAILED",
            Event::CommandRetried => "COMMAND_RETRIED",
            Event::CommandRejected => "COMMAND_REJECTED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::JournalCorruption | Event::RecoveryFailed)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_screaming_snake_case() {
        let events = [
            Event::EnvOpen,
            Event::EnvReady,
            Event::EnvClosed,
            Event::ConfigLoaded,
            Event::JournalAppend,
            Event::JournalRotate,
            Event::JournalSync,
            Event::JournalRecycled,
            Event::JournalCorruption,
            Event::FlushComplete,
            Event::FlushFailed,
            Event::RecoveryStart,
            Event::RecoveryComplete,
            Event::RecoveryFailed,
            Event::MergerStarted,
            Event::MergerStopped,
            Event::BatchCommitted,
            Event::BatchFailed,
            Event::CommandRetried,
            Event::CommandRejected,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::JournalCorruption.is_fatal());
        assert!(Event::RecoveryFailed.is_fatal());
        assert!(!Event::FlushFailed.is_fatal());
        assert!(!Event::BatchFailed.is_fatal());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(Event::RecoveryStart.to_string(), "RECOVERY_BEGIN");
    }
}
