//! CLI command implementations
//!
//! Each command loads the configuration, does its work and returns a JSON
//! value that `run_command` prints. `init` and `flush` open the storage
//! environment (which runs recovery); `report` and `journals` only read the
//! store's files and never change them.

use std::path::Path;

use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::journal::{list_journals, FlushMarker};
use crate::observability::{init_tracing, Event, Logger};
use crate::report::{scan_journals, StorageReport};
use crate::tx::StorageEnvironment;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    init_tracing();
    let cli = super::args::Cli::parse_args();
    match run_command(cli.command) {
        Ok(data) => write_response(data),
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            Err(e)
        }
    }
}

pub fn run_command(cmd: Command) -> CliResult<Value> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Report { config, detailed } => report(&config, detailed),
        Command::Journals { config } => journals(&config),
        Command::Flush { config } => flush(&config),
    }
}

/// Create the data directory, data file and first journal.
///
/// Fails if the data file already exists.
pub fn init(config_path: &Path) -> CliResult<Value> {
    let config = load_config(config_path)?;
    if is_initialized(&config) {
        return Err(CliError::already_initialized());
    }

    let data_file = config.data_file_path();
    let journal_dir = config.journal_dir();
    let env = StorageEnvironment::open(config)?;
    env.close()?;

    Ok(json!({
        "initialized": true,
        "data_file": data_file,
        "journal_dir": journal_dir,
    }))
}

/// Space accounting and flush progress
pub fn report(config_path: &Path, detailed: bool) -> CliResult<Value> {
    let config = load_existing(config_path)?;
    let report = StorageReport::inspect(&config)?;
    let mut value = serde_json::to_value(&report)?;
    if detailed {
        let marker = FlushMarker::read_from_dir(&config.data_dir)
            .map_err(|e| CliError::storage_failed(e.to_string()))?;
        value["flush_marker"] = serde_json::to_value(marker)?;
    }
    Ok(value)
}

pub fn journals(config_path: &Path) -> CliResult<Value> {
    let config = load_existing(config_path)?;
    let journal_dir = config.journal_dir();
    let live = scan_journals(&journal_dir)?;
    let listing =
        list_journals(&journal_dir).map_err(|e| CliError::storage_failed(e.to_string()))?;

    Ok(json!({
        "live": live,
        "recyclable": listing.recyclable,
    }))
}

/// Apply every committed transaction to the data file and retire journals
pub fn flush(config_path: &Path) -> CliResult<Value> {
    let env = open_existing(config_path)?;
    env.sync_journal()?;
    let outcome = env.flush_now()?;
    let marker = env.last_flushed();
    env.close()?;

    Ok(json!({
        "flushed_upto": outcome.flushed_upto,
        "pages_written": outcome.pages_written,
        "journals_retired": outcome.journals_retired,
        "last_flushed_journal": marker.last_flushed_journal,
    }))
}

fn load_config(config_path: &Path) -> CliResult<EngineConfig> {
    let config = EngineConfig::load(config_path)?;
    Logger::info(
        Event::ConfigLoaded.as_str(),
        &[
            ("path", &config_path.display().to_string()),
            ("data_dir", &config.data_dir.display().to_string()),
        ],
    );
    Ok(config)
}

fn load_existing(config_path: &Path) -> CliResult<EngineConfig> {
    let config = load_config(config_path)?;
    if !is_initialized(&config) {
        return Err(CliError::not_initialized());
    }
    Ok(config)
}

fn open_existing(config_path: &Path) -> CliResult<StorageEnvironment> {
    Ok(StorageEnvironment::open(load_existing(config_path)?)?)
}

fn is_initialized(config: &EngineConfig) -> bool {
    config.data_file_path().exists() && config.journal_dir().exists()
}
