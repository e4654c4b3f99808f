//! Rate-limited work for aerostore
//!
//! Drives a queue of items through the merger without letting one caller
//! monopolize the single writer: a token bucket caps admissions, and a
//! batch that runs out of tokens ends early and reports that it needs to
//! wait instead of blocking the writer thread.

mod cancel;
mod driver;
mod gate;

pub use cancel::OperationCancelToken;
pub use driver::{ExecuteRateLimitedOperations, RateLimitedStats, SharedQueue, RATE_LIMITED_KIND};
pub use gate::RateGate;
