//! Core data-model types shared across the acquisition engine.
//!
//! These mirror the explicit-state-machine recommendation: every loop
//! transition is a named variant, not a raw counter compared against a
//! magic number.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the Source Reader was attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    BlockDevice(PathBuf),
    RegularFile(PathBuf),
    Stdin,
    Listener { port: u16 },
}

/// What little the coordinator knows about the source before the first read.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub sector_size: u32,
    /// `None` when the source cannot report its size up front (stdin, a
    /// network listener, some character devices).
    pub total_size: Option<u64>,
}

impl SourceDescriptor {
    pub fn total_sectors(&self) -> Option<u64> {
        self.total_size.map(|s| s / self.sector_size as u64)
    }
}

/// `error_mode` from spec.md §3 — recover-and-continue vs. abort-on-first-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Retry, then skip, then try the mirrored direction; never aborts.
    Recover,
    /// The first unrecoverable read error terminates the run.
    Abort,
}

/// Which way the read loop is currently walking the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
    /// Both directions have met or given up; nothing left to read.
    None,
}

/// Outcome of a single read call against the source, classified the way
/// `image_loop`'s inner read does: full batch, a short (partial) batch,
/// a clean EOF, or an I/O failure.
#[derive(Debug)]
pub enum ReadOutcome {
    Full(Vec<u8>),
    Partial { data: Vec<u8>, bytes: usize },
    Empty,
    Err(std::io::Error),
}

/// Why the read loop stopped. Carried by `LoopState::Terminated` and surfaced
/// in the final report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Forward and reverse cursors met: every sector was read or accounted for.
    WindowExhausted,
    /// `error_mode == Abort` and a read failed.
    AbortedOnError { sector: u64 },
    /// Consecutive error regions exceeded the tolerance in both directions.
    GaveUpBothDirections,
    /// Caught SIGINT/SIGTERM.
    Interrupted,
    /// `max_size` was reached.
    SizeLimitReached,
}

/// Named read-loop states, replacing raw retry/region counters with an
/// explicit state machine per the Design Notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    ForwardScanning,
    ForwardRetrying { attempts: u32 },
    ForwardRegionGiveUp { regions: u32 },
    ReverseScanning,
    ReverseRetrying { attempts: u32 },
    ReverseRegionGiveUp { regions: u32 },
    Terminated { reason: TerminationReason },
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Terminated { .. })
    }
}

/// Running tally of what the loop has done, reported at the end of the run
/// and used to decide when a direction gives up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub sectors_read: u64,
    pub sectors_bad: u64,
    pub bytes_written: u64,
    pub retries_forward: u32,
    pub retries_reverse: u32,
    pub regions_given_up_forward: u32,
    pub regions_given_up_reverse: u32,
    pub blank_sectors: u64,
}
