//! Archive Sink (D) contract — spec.md §4.4.
//!
//! The read loop (F) never touches an archive format directly; it only
//! knows `Sink`. This lets the container format evolve (or be swapped for
//! a test double) without touching acquisition logic, the same separation
//! the teacher draws between `io_stream` (mechanism) and `archive.rs`
//! (policy).

use crate::codec::CodecId;
use crate::error::SinkError;

/// The four moments the sink announces around every page write, used both
/// for timing accounting and by the compression controller (E) to decide
/// whether compression is worth its cost on this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CompressionStart,
    CompressionEnd,
    WriteStart,
    WriteEnd,
}

/// Receives a `Phase` notification plus the page sequence number it
/// applies to. Implementors are expected to be cheap (called four times
/// per page) — typically a `Vec<Instant>` or atomic counters.
pub trait SinkCallback: Send {
    fn on_phase(&mut self, page_index: u64, phase: Phase);
}

/// A callback that does nothing; used whenever the caller hasn't wired up
/// timing or adaptive compression.
pub struct NullCallback;
impl SinkCallback for NullCallback {
    fn on_phase(&mut self, _page_index: u64, _phase: Phase) {}
}

/// Destination for acquired pages and run metadata.
///
/// Mirrors the union of `af_lib`-style sink operations spec.md §4.4
/// enumerates: geometry setup, optional compression, page I/O addressed
/// by byte offset, a flat segment (key/value) namespace for metadata, and
/// a bad-sector flag list.
pub trait Sink {
    /// Sector size the source reports; stored for later verification.
    fn set_sector_size(&mut self, bytes: u32);
    /// Page size used to chunk incoming writes into blocks.
    fn set_page_size(&mut self, bytes: u32);
    /// Optional cap on total on-disk size; `0` means unbounded.
    fn set_max_size(&mut self, bytes: u64);
    /// Enable per-page compression with the given codec/level. Not calling
    /// this leaves pages stored uncompressed (`CodecId::None`).
    fn enable_compression(&mut self, codec: CodecId, level: i32);
    /// Install the phase-notification callback for this run.
    fn set_callback(&mut self, callback: Box<dyn SinkCallback>);
    /// Record the acquisition start timestamp (RFC 3339) in the archive.
    fn set_acquisition_date(&mut self, rfc3339: &str);
    /// Return the archive's unique identifier, generated at creation.
    fn make_gid(&self) -> String;

    /// Reposition the next `write` call at logical byte offset `offset`
    /// in the source stream. Used by the read loop when it flips
    /// direction or resumes after a skipped region.
    fn seek(&mut self, offset: u64) -> Result<(), SinkError>;
    /// Append `data`, logically located at the sink's current position,
    /// advancing that position by `data.len()`.
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
    /// Current logical write position.
    fn tell(&self) -> u64;

    /// Mark `[offset, offset + length)` as unreadable on the source. The
    /// region is still represented in the archive (as marker-filled
    /// pages) so offsets stay meaningful, but is flagged for later
    /// recovery.
    fn bad_flag(&mut self, offset: u64, length: u64) -> Result<(), SinkError>;

    /// The fill byte used to build the sector-sized bad-sector marker
    /// pattern (spec.md §4.4's `bad_flag() → sector_size-length byte
    /// pattern`). The read loop repeats this byte to pre-fill read
    /// buffers, so any unread tail of a short read persists as the same
    /// pattern `bad_flag` writes for a region given up on entirely.
    fn bad_flag_byte(&self) -> u8;

    /// Whether a page starting at logical byte `offset` has already been
    /// written. Used by Recover-Scan (G) to find the pages an interrupted
    /// run never reached.
    fn has_page(&self, offset: u64) -> bool;

    /// Set a metadata segment by name. Overwrites any existing value.
    fn update_seg(&mut self, name: &str, value: &[u8]) -> Result<(), SinkError>;
    /// Read back a previously set segment, if any.
    fn get_seg(&self, name: &str) -> Option<Vec<u8>>;
    /// Remove a segment entirely (used to delete digest segments when
    /// `hash_invalid` latches during the run).
    fn del_seg(&mut self, name: &str) -> Result<(), SinkError>;

    /// The codec currently in effect for new page writes.
    fn compression_type(&self) -> CodecId;

    /// Flush all pending state and write the final index/superblock.
    /// Must be called exactly once, after the last `write`.
    fn finalize(&mut self) -> Result<(), SinkError>;
}
