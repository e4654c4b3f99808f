//! CLI argument definitions using clap
//!
//! Commands:
//! - aerostore init --config <path>
//! - aerostore report --config <path> [--detailed]
//! - aerostore journals --config <path>
//! - aerostore flush --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerostore - transactional page storage with a write-ahead journal
#[derive(Parser, Debug)]
#[command(name = "aerostore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data file and journal directory
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./aerostore.json")]
        config: PathBuf,
    },

    /// Print a storage report as JSON
    Report {
        /// Path to configuration file
        #[arg(long, default_value = "./aerostore.json")]
        config: PathBuf,

        /// Include version table and reader details
        #[arg(long)]
        detailed: bool,
    },

    /// List live and recyclable journal files
    Journals {
        /// Path to configuration file
        #[arg(long, default_value = "./aerostore.json")]
        config: PathBuf,
    },

    /// Recover, then flush every committed transaction into the data file
    Flush {
        /// Path to configuration file
        #[arg(long, default_value = "./aerostore.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
