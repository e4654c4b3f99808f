//! Engine configuration
//!
//! Loaded from a JSON file. Every field except `data_dir` is optional and
//! falls back to its default; the loaded file is validated before use.
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/aerostore",
//!   "sync_mode": "deferred",
//!   "merger": { "max_batch_items": 512 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::journal::{FlushSettings, JournalConfig, SyncMode};
use crate::scratch::ScratchLimits;
use crate::storage::PAGE_SIZE;

const DATA_FILE: &str = "data.aerostore";
const JOURNAL_DIR: &str = "journal";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the data file, journals and flush marker
    pub data_dir: PathBuf,

    #[serde(default = "default_initial_data_pages")]
    pub initial_data_pages: u64,

    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Deferred mode: unsynced journal bytes that force a sync
    #[serde(default = "default_max_unsynced_bytes")]
    pub max_unsynced_bytes: u64,

    #[serde(default = "default_journal_file_size")]
    pub journal_file_size_bytes: u64,

    /// Flushed journals kept for reuse instead of deleted
    #[serde(default = "default_max_recyclable_journals")]
    pub max_recyclable_journals: usize,

    /// Dirty bytes after which a transaction stops taking more work
    #[serde(default = "default_max_transaction_size")]
    pub max_transaction_size_bytes: u64,

    #[serde(default = "default_max_transaction_duration_ms")]
    pub max_transaction_duration_ms: u64,

    #[serde(default)]
    pub scratch: ScratchConfig,

    #[serde(default)]
    pub flush: FlushConfig,

    #[serde(default)]
    pub merger: MergerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchConfig {
    #[serde(default = "default_max_arena_bytes")]
    pub max_arena_bytes: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    #[serde(default = "default_keep_arenas")]
    pub keep_arenas: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Unflushed committed bytes at which a commit wakes the flusher early
    #[serde(default = "default_wake_after_bytes")]
    pub wake_after_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergerSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_initial_data_pages() -> u64 {
    256
}
fn default_max_unsynced_bytes() -> u64 {
    32 * 1024 * 1024
}
fn default_journal_file_size() -> u64 {
    64 * 1024 * 1024
}
fn default_max_recyclable_journals() -> usize {
    2
}
fn default_max_transaction_size() -> u64 {
    64 * 1024 * 1024
}
fn default_max_transaction_duration_ms() -> u64 {
    500
}
fn default_max_arena_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_max_total_bytes() -> usize {
    1024 * 1024 * 1024
}
fn default_keep_arenas() -> usize {
    2
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_backoff_initial_ms() -> u64 {
    50
}
fn default_backoff_max_ms() -> u64 {
    5000
}
fn default_wake_after_bytes() -> u64 {
    8 * 1024 * 1024
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_max_batch_items() -> usize {
    1024
}
fn default_max_batch_bytes() -> u64 {
    16 * 1024 * 1024
}
fn default_max_conflict_retries() -> u32 {
    3
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            max_arena_bytes: default_max_arena_bytes(),
            max_total_bytes: default_max_total_bytes(),
            keep_arenas: default_keep_arenas(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_flush_interval_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            wake_after_bytes: default_wake_after_bytes(),
        }
    }
}

impl Default for MergerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_batch_items: default_max_batch_items(),
            max_batch_bytes: default_max_batch_bytes(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            initial_data_pages: default_initial_data_pages(),
            sync_mode: SyncMode::default(),
            max_unsynced_bytes: default_max_unsynced_bytes(),
            journal_file_size_bytes: default_journal_file_size(),
            max_recyclable_journals: default_max_recyclable_journals(),
            max_transaction_size_bytes: default_max_transaction_size(),
            max_transaction_duration_ms: default_max_transaction_duration_ms(),
            scratch: ScratchConfig::default(),
            flush: FlushConfig::default(),
            merger: MergerSettings::default(),
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        if self.journal_file_size_bytes < 2 * crate::journal::UNIT_SIZE as u64 {
            return Err(ConfigError::Invalid(
                "journal_file_size_bytes must hold at least one record unit".into(),
            ));
        }
        if self.max_transaction_size_bytes < PAGE_SIZE as u64 {
            return Err(ConfigError::Invalid(
                "max_transaction_size_bytes must be at least one page".into(),
            ));
        }
        if self.scratch.max_arena_bytes < PAGE_SIZE {
            return Err(ConfigError::Invalid(
                "scratch.max_arena_bytes must be at least one page".into(),
            ));
        }
        if self.scratch.max_total_bytes < self.scratch.max_arena_bytes {
            return Err(ConfigError::Invalid(
                "scratch.max_total_bytes must be >= scratch.max_arena_bytes".into(),
            ));
        }
        if self.merger.queue_capacity == 0 {
            return Err(ConfigError::Invalid("merger.queue_capacity must be > 0".into()));
        }
        if self.merger.max_batch_items == 0 {
            return Err(ConfigError::Invalid("merger.max_batch_items must be > 0".into()));
        }
        if self.flush.backoff_initial_ms == 0 || self.flush.backoff_max_ms < self.flush.backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "flush backoff must satisfy 0 < backoff_initial_ms <= backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.data_dir.join(DATA_FILE)
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_DIR)
    }

    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            file_size_bytes: self.journal_file_size_bytes,
            sync_mode: self.sync_mode,
            max_unsynced_bytes: self.max_unsynced_bytes,
            max_recyclable_journals: self.max_recyclable_journals,
        }
    }

    pub fn scratch_limits(&self) -> ScratchLimits {
        ScratchLimits {
            max_arena_bytes: self.scratch.max_arena_bytes,
            max_total_bytes: self.scratch.max_total_bytes,
            keep_arenas: self.scratch.keep_arenas,
        }
    }

    pub fn flush_settings(&self) -> FlushSettings {
        FlushSettings {
            interval: Duration::from_millis(self.flush.interval_ms),
            backoff_initial: Duration::from_millis(self.flush.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.flush.backoff_max_ms),
        }
    }

    pub fn max_transaction_duration(&self) -> Duration {
        Duration::from_millis(self.max_transaction_duration_ms)
    }
}
