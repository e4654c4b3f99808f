//! Observability subsystem for aerostore
//!
//! This module provides:
//! - Structured event logging routed through `tracing`
//! - Operational counters
//! - Begin/complete scopes for long-running work
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on execution
//! 3. Logging failures never fail a storage operation
//!
//! # Usage
//!
//! ```ignore
//! use aerostore::observability::{log_event_with_fields, Event, ObservationScope};
//!
//! log_event_with_fields(Event::JournalRotate, &[("journal", "4")]);
//!
//! let scope = ObservationScope::new("FLUSH");
//! // ... do work ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Log a lifecycle event with fields; fatal events log at FATAL
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event_severity(event), event.as_str(), fields);
}

fn event_severity(event: Event) -> Severity {
    if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    }
}

/// Default level when `RUST_LOG` is unset or does not parse
const DEFAULT_FILTER: &str = "info";

/// Filter from a `RUST_LOG`-style directive string
fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a global JSON subscriber filtered by `RUST_LOG`.
///
/// Only binaries call this; the library never installs a subscriber.
/// Returns false if a subscriber was already installed.
pub fn init_tracing() -> bool {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_from(directives.as_deref());
    let layer = fmt::layer().json().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parses_directives() {
        let filter = filter_from(Some("aerostore=debug"));
        assert_eq!(filter.to_string(), "aerostore=debug");
    }

    #[test]
    fn test_filter_falls_back_to_info() {
        assert_eq!(filter_from(None).to_string(), DEFAULT_FILTER);
        assert_eq!(filter_from(Some("aerostore=loud")).to_string(), DEFAULT_FILTER);
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(event_severity(Event::JournalCorruption), Severity::Fatal);
        assert_eq!(event_severity(Event::RecoveryFailed), Severity::Fatal);
        assert_eq!(event_severity(Event::BatchCommitted), Severity::Info);
    }
}
