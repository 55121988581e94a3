//! Acquisition configuration — an immutable value handed to the
//! [`crate::acquire::coordinator::Coordinator`], per Design Notes §9
//! ("make configuration an immutable value passed into the Coordinator").
//!
//! An optional TOML file (loaded with `toml`, already in the dependency
//! table for the container format) supplies defaults; explicit CLI flags
//! always win. Fields not overridden by either source fall back to
//! [`AcquireConfig::default`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acquire::model::ErrorMode;
use crate::codec::CodecId;
use crate::error::ConfigError;
use crate::io_stream::{DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL};

/// Default sector size used whenever the source cannot report its own.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;
/// Default batch size for a single read call, in sectors.
pub const DEFAULT_READ_SECTORS: u32 = 256;
/// Default number of retries before a region is given up on.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquireConfig {
    /// Device path, `"-"` for stdin, or `listen:<port>`.
    pub input: String,
    /// Output archive path.
    pub output: String,
    /// Starting skip offset, in bytes. Must be sector-aligned.
    pub skip_bytes: u64,
    /// Start the read loop in reverse instead of forward.
    pub reverse_start: bool,
    /// 0 = recover (retry + skip + reverse), 1 = abort on first error.
    pub error_mode: ErrorMode,
    /// Retries tolerated per defect region before giving up on it.
    pub retry_count: u32,
    /// Sectors requested per read call (capped by the source's own max).
    pub read_sectors: u32,
    /// Sink page size in bytes.
    pub page_size: u32,
    /// Optional cap on total archive size, 0 = unbounded.
    pub max_size: u64,
    /// Compression algorithm.
    pub codec: CodecId,
    /// Compression level passed to the codec.
    pub compression_level: i32,
    /// Disable compression entirely.
    pub no_compress: bool,
    /// Run the one-shot A/B adaptive-compression experiment.
    pub adaptive_compress: bool,
    /// Skip all hashing.
    pub no_hash: bool,
    /// Hash on an auxiliary thread via a bounded (capacity 1) hand-off.
    pub multithread_hash: bool,
    /// Allow imaging a regular file (normally rejected).
    pub allow_regular_file: bool,
    /// Run recover-scan against an existing partial archive instead of a
    /// fresh acquisition.
    pub recover_scan: bool,
    /// Technician-entered case metadata, stored verbatim in the archive.
    pub case_number: Option<String>,
    pub technician: Option<String>,
    /// Best-effort MAC address / kernel ring buffer capture.
    pub collect_mac_addresses: bool,
    pub collect_kernel_log: bool,
    /// Exit immediately on the first interrupt signal instead of
    /// attempting a graceful sink close.
    pub fast_quit: bool,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            output: String::new(),
            skip_bytes: 0,
            reverse_start: false,
            error_mode: ErrorMode::Recover,
            retry_count: DEFAULT_RETRY_COUNT,
            read_sectors: DEFAULT_READ_SECTORS,
            page_size: DEFAULT_CHUNK_SIZE as u32,
            max_size: 0,
            codec: CodecId::Zstd,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            no_compress: false,
            adaptive_compress: false,
            no_hash: false,
            multithread_hash: false,
            allow_regular_file: false,
            recover_scan: false,
            case_number: None,
            technician: None,
            collect_mac_addresses: true,
            collect_kernel_log: true,
            fast_quit: false,
        }
    }
}

impl AcquireConfig {
    /// Load defaults from a TOML file at `path`; fields missing in the
    /// file fall back to [`AcquireConfig::default`]. Callers then apply
    /// CLI overrides on top of the result.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Validate the subset of `ConfigurationError` conditions spec.md §7
    /// assigns to pre-acquisition checks. Must be called before the
    /// source is opened.
    pub fn validate(&self, sector_size: u32, source_size_known: bool) -> Result<(), ConfigError> {
        if self.skip_bytes % sector_size as u64 != 0 {
            return Err(ConfigError::SkipNotAligned(self.skip_bytes, sector_size));
        }
        if self.reverse_start && !source_size_known {
            return Err(ConfigError::ReverseOnUnknownSize);
        }
        Ok(())
    }
}
