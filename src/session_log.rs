//! Session/position log: an append-only record of every bounce, read back
//! at startup to put the star where the last session left it.

use crate::error::LogError;
use crate::jsonl_reader::{StepReader, STEP_LOG_FORMAT, STEP_LOG_VERSION};
use crate::types::{StepRecord, Vector3};
use log::{info, warn};
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Where a fresh session starts when there is no history.
pub const DEFAULT_SEED_POSITION: Vector3 = Vector3::new(0.0, 40.0, 0.0);

/// Append-only store of step records, in insertion order.
pub trait StepLog: Send {
    fn append(&mut self, record: &StepRecord) -> Result<(), LogError>;
    fn all(&self) -> Result<Vec<StepRecord>, LogError>;
    fn count(&self) -> Result<usize, LogError>;
}

impl<T: StepLog + ?Sized> StepLog for Box<T> {
    fn append(&mut self, record: &StepRecord) -> Result<(), LogError> {
        (**self).append(record)
    }

    fn all(&self) -> Result<Vec<StepRecord>, LogError> {
        (**self).all()
    }

    fn count(&self) -> Result<usize, LogError> {
        (**self).count()
    }
}

// ─── In-memory ──────────────────────────────────────────────────────────────

/// Log that lives only as long as the process. Used when persistence is
/// off or the file store could not be opened.
#[derive(Debug, Clone, Default)]
pub struct MemoryStepLog {
    records: Vec<StepRecord>,
}

impl MemoryStepLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepLog for MemoryStepLog {
    fn append(&mut self, record: &StepRecord) -> Result<(), LogError> {
        self.records.push(*record);
        Ok(())
    }

    fn all(&self) -> Result<Vec<StepRecord>, LogError> {
        Ok(self.records.clone())
    }

    fn count(&self) -> Result<usize, LogError> {
        Ok(self.records.len())
    }
}

// ─── JSONL file ─────────────────────────────────────────────────────────────

/// File-backed log: a header line, then one JSON record per line.
/// Every append is flushed so a crash loses at most the bounce in flight.
pub struct JsonlStepLog {
    path: PathBuf,
    writer: BufWriter<File>,
    count: usize,
}

impl JsonlStepLog {
    /// Open (or create) the log at `path`, creating parent directories.
    /// Existing records are kept and counted. A partial last line left by a
    /// crash is terminated so the next append starts on a line of its own.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(unavailable(path))?;
            }
        }

        let existing = match File::open(path) {
            Ok(mut f) => {
                let len = f.metadata().map_err(unavailable(path))?.len();
                if len == 0 {
                    None
                } else {
                    let terminated = ends_with_newline(&mut f, len).map_err(unavailable(path))?;
                    f.seek(SeekFrom::Start(0)).map_err(unavailable(path))?;
                    let reader = StepReader::open(BufReader::new(f)).map_err(|reason| {
                        LogError::Corrupt {
                            path: path.to_path_buf(),
                            reason,
                        }
                    })?;
                    Some((reader.read_all().len(), terminated))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(unavailable(path)(e)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(unavailable(path))?;
        let mut writer = BufWriter::new(file);

        let count = match existing {
            Some((n, true)) => n,
            Some((n, false)) => {
                warn!("Step log {:?} ends in a partial line; dropping it", path);
                writeln!(writer).map_err(unavailable(path))?;
                writer.flush().map_err(unavailable(path))?;
                n
            }
            None => {
                let header = json!({
                    "format": STEP_LOG_FORMAT,
                    "version": STEP_LOG_VERSION,
                    "system": "genie-fall",
                });
                writeln!(writer, "{}", header).map_err(unavailable(path))?;
                writer.flush().map_err(unavailable(path))?;
                0
            }
        };

        info!("Step log → {:?} ({} prior steps)", path, count);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            count,
        })
    }
}

impl StepLog for JsonlStepLog {
    fn append(&mut self, record: &StepRecord) -> Result<(), LogError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", line).map_err(unavailable(&self.path))?;
        self.writer.flush().map_err(unavailable(&self.path))?;
        self.count += 1;
        Ok(())
    }

    fn all(&self) -> Result<Vec<StepRecord>, LogError> {
        let f = File::open(&self.path).map_err(unavailable(&self.path))?;
        let reader = StepReader::open(BufReader::new(f)).map_err(|reason| LogError::Corrupt {
            path: self.path.clone(),
            reason,
        })?;
        Ok(reader.read_all())
    }

    fn count(&self) -> Result<usize, LogError> {
        Ok(self.count)
    }
}

fn ends_with_newline(f: &mut File, len: u64) -> io::Result<bool> {
    f.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn unavailable(path: &Path) -> impl FnOnce(io::Error) -> LogError {
    let path = path.to_path_buf();
    move |source| LogError::StorageUnavailable { path, source }
}

// ─── Session seed ───────────────────────────────────────────────────────────

/// What a new session inherits from the log: the starting position (the
/// last bounce), a marker for every earlier step, and the bounce count.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSeed {
    pub position: Vector3,
    pub markers: Vec<Vector3>,
    pub bounces: usize,
}

impl SessionSeed {
    pub fn from_records(records: &[StepRecord]) -> Self {
        Self {
            position: records
                .last()
                .map(|r| r.position)
                .unwrap_or(DEFAULT_SEED_POSITION),
            markers: records.iter().map(|r| r.position).collect(),
            bounces: records.iter().map(|r| r.bounce).max().unwrap_or(0) as usize,
        }
    }

    /// Read the seed from a log. An unreadable log seeds a fresh session.
    pub fn load<L: StepLog + ?Sized>(log: &L) -> Self {
        match log.all() {
            Ok(records) => Self::from_records(&records),
            Err(e) => {
                warn!("Could not read step history ({}); starting fresh", e);
                Self::from_records(&[])
            }
        }
    }
}
