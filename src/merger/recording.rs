//! Command recording and replay
//!
//! A recorder writes one JSON line per event: a batch marker carrying the
//! transaction id, the replay descriptor of every command before it runs,
//! an `aborted` line for commands whose effects were rolled back, and a
//! final `committed` or `failed` line for the batch.
//!
//! [`CommandRegistry::replay`] rebuilds the commands of committed batches
//! only, in their original order.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tx::TxId;

use super::command::{MergedCommand, ReplayableCommandDto};
use super::errors::CommandError;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed recording line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    #[error("failed to encode recording entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("no command registered for kind {0}")]
    UnknownKind(String),

    #[error("failed to rebuild {kind} command: {source}")]
    Rebuild { kind: String, source: CommandError },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedEntry {
    Batch { tx_id: TxId },
    Command { index: usize, dto: ReplayableCommandDto },
    Aborted { index: usize },
    Committed { tx_id: TxId },
    Failed { tx_id: TxId },
}

pub struct CommandRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CommandRecorder {
    /// Create (or append to) a recording file
    pub fn create(path: &Path) -> Result<Self, RecordingError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_batch(&mut self, tx_id: TxId) -> Result<(), RecordingError> {
        self.write(&RecordedEntry::Batch { tx_id })
    }

    pub fn record(&mut self, index: usize, dto: ReplayableCommandDto) -> Result<(), RecordingError> {
        self.write(&RecordedEntry::Command { index, dto })
    }

    pub fn abort(&mut self, index: usize) -> Result<(), RecordingError> {
        self.write(&RecordedEntry::Aborted { index })
    }

    /// Close a batch; the file is flushed at batch end
    pub fn end_batch(&mut self, tx_id: TxId, committed: bool) -> Result<(), RecordingError> {
        let entry = if committed {
            RecordedEntry::Committed { tx_id }
        } else {
            RecordedEntry::Failed { tx_id }
        };
        self.write(&entry)?;
        self.writer.flush()?;
        Ok(())
    }

    fn write(&mut self, entry: &RecordedEntry) -> Result<(), RecordingError> {
        serde_json::to_writer(&mut self.writer, entry).map_err(RecordingError::Encode)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

type CommandFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn MergedCommand>, CommandError> + Send + Sync>;

/// Committed batch rebuilt from a recording
pub struct ReplayedBatch {
    pub tx_id: TxId,
    pub commands: Vec<Box<dyn MergedCommand>>,
}

/// Maps command kinds to constructors from their replay descriptor
#[derive(Default)]
pub struct CommandRegistry {
    factories: HashMap<String, CommandFactory>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn MergedCommand>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn build(&self, dto: &ReplayableCommandDto) -> Result<Box<dyn MergedCommand>, RecordingError> {
        let factory = self
            .factories
            .get(&dto.kind)
            .ok_or_else(|| RecordingError::UnknownKind(dto.kind.clone()))?;
        factory(&dto.payload).map_err(|source| RecordingError::Rebuild {
            kind: dto.kind.clone(),
            source,
        })
    }

    /// Rebuild the commands of every committed batch in `path`.
    ///
    /// A batch without a closing line (process died mid-batch) is skipped.
    pub fn replay(&self, path: &Path) -> Result<Vec<ReplayedBatch>, RecordingError> {
        let reader = BufReader::new(File::open(path)?);
        let mut batches = Vec::new();
        let mut current: Option<(TxId, Vec<(usize, ReplayableCommandDto)>, BTreeSet<usize>)> = None;

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: RecordedEntry = serde_json::from_str(&line).map_err(|source| {
                RecordingError::Malformed {
                    line: number + 1,
                    source,
                }
            })?;

            match entry {
                RecordedEntry::Batch { tx_id } => {
                    current = Some((tx_id, Vec::new(), BTreeSet::new()));
                }
                RecordedEntry::Command { index, dto } => {
                    if let Some((_, commands, _)) = current.as_mut() {
                        commands.push((index, dto));
                    }
                }
                RecordedEntry::Aborted { index } => {
                    if let Some((_, _, aborted)) = current.as_mut() {
                        aborted.insert(index);
                    }
                }
                RecordedEntry::Committed { tx_id } => {
                    if let Some((_, commands, aborted)) = current.take() {
                        let commands = commands
                            .into_iter()
                            .filter(|(index, _)| !aborted.contains(index))
                            .map(|(_, dto)| self.build(&dto))
                            .collect::<Result<Vec<_>, _>>()?;
                        batches.push(ReplayedBatch { tx_id, commands });
                    }
                }
                RecordedEntry::Failed { .. } => {
                    current = None;
                }
            }
        }
        Ok(batches)
    }
}
