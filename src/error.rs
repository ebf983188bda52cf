//! Error types, one enum per concern.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::genie::MAX_BUTTON;

/// Errors from loading weights into, or stepping, the sequence model.
#[derive(Debug, Error)]
pub enum GenieError {
    /// A tensor is present but its shape does not match the architecture.
    #[error("tensor {name}: expected shape {expected:?}, got {actual:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing tensor {0}")]
    MissingTensor(String),

    #[error("tensor {name}: unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    /// `next` was called before weights were loaded and state was reset.
    #[error("model not initialized: load weights and reset state first")]
    NotInitialized,

    #[error("button {0} out of range 0..={max}", max = MAX_BUTTON)]
    InvalidButton(u8),

    #[error("key list must be non-empty with every key in 0..88")]
    InvalidKeyList,

    #[error("weight file {path:?}: {source}")]
    WeightIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("weight manifest: {0}")]
    Manifest(String),
}

/// Errors from the session/position log. None of these are fatal to a
/// session; callers log them and carry on without persistence.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("step log storage unavailable at {path:?}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("step log {path:?} is not a genie-fall step log: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("step record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("instrument io: {0}")]
    Io(#[from] io::Error),

    #[error("wav: {0}")]
    Wav(#[from] hound::Error),

    #[error("osc encode: {0:?}")]
    Osc(rosc::OscError),

    #[error("unknown note name {0:?}")]
    UnknownNote(String),

    #[error("sample {0:?} contains no audio")]
    EmptySample(PathBuf),
}

impl From<rosc::OscError> for InstrumentError {
    fn from(e: rosc::OscError) -> Self {
        InstrumentError::Osc(e)
    }
}
