//! Error types for the acquisition engine.
//!
//! One `thiserror` enum per subsystem, in the same spirit as the
//! container format's `CodecError` / `SuperblockError` / `CryptoError`.
//! Lower-layer errors fold into `AcquireError` via `#[from]`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("output path already exists: {0}")]
    OutputExists(String),
    #[error("skip offset {0} bytes is not a multiple of sector size {1}")]
    SkipNotAligned(u64, u32),
    #[error("reverse-start requested but source size is unknown")]
    ReverseOnUnknownSize,
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the Source Reader (A). Recovered locally by the read loop
/// under `error_mode == 0`; never fatal by itself.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open source '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("seek failed to offset {offset}: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("reverse read attempted on a source of unknown size")]
    ReverseOnUnknownSize,
}

/// Errors from the Archive Sink (D). Always fatal.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Write(#[source] io::Error),
    #[error("sink error: {0}")]
    Other(String),
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::Write(e)
    }
}

/// Device attach/detach command failure (named ATA/SCSI bus open).
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("device attach command failed after {attempts} attempt(s): {reason}")]
    ExhaustedRetries { attempts: u32, reason: String },
}

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("source IO error: {0}")]
    Source(#[from] SourceError),
    #[error("sink IO error: {0}")]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("acquisition interrupted by signal")]
    Interrupted,
    #[error(transparent)]
    Lock(#[from] crate::acquire::lock::LockError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
