//! CLI module for aerostore
//!
//! Provides command-line interface for:
//! - init: Create the data file and journal directory
//! - report: Print space usage and flush progress
//! - journals: List journal files
//! - flush: Drain committed transactions into the data file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{flush, init, journals, report, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
