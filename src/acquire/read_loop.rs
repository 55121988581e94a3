//! Read Loop State Machine (F) — spec.md §4.6, the heart of the system.
//!
//! Drives `(low, high, direction, retry, region_retry)` through the
//! acquisition window until a terminal condition is reached. Transitions
//! are represented as named [`LoopState`] variants rather than raw
//! counters compared against a magic number, per the Design Notes'
//! explicit-state-machine recommendation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::acquire::classifier::SectorClassifier;
use crate::acquire::compression_ctl::CompressionController;
use crate::acquire::hash::RunningHash;
use crate::acquire::model::{Direction, ErrorMode, LoopState, ReadOutcome, TerminationReason, Counters};
use crate::acquire::sink::Sink;
use crate::acquire::source::SourceReader;
use crate::codec::CodecId;
use crate::error::{AcquireError, SinkError};

/// Debounced status notification, fired before every read attempt.
pub trait StatusCallback: Send {
    fn on_status(&mut self, direction: Direction, low: u64, high: Option<u64>, counters: &Counters);
}

pub struct NullStatus;
impl StatusCallback for NullStatus {
    fn on_status(&mut self, _direction: Direction, _low: u64, _high: Option<u64>, _counters: &Counters) {}
}

pub struct ReadLoopConfig {
    pub start_sector: u64,
    /// `None` means streaming: unknown size, forward-only, no retry.
    pub total_sectors: Option<u64>,
    pub starting_direction: Direction,
    pub read_sectors: u32,
    pub max_read_sectors: u32,
    pub error_mode: ErrorMode,
    pub retry_count: u32,
    pub sector_size: u32,
    /// Codec applied to segments the Compression Controller (E) decides
    /// should be compressed. Ignored when `compression_ctl` is `None`.
    pub codec: CodecId,
    pub level: i32,
}

pub struct ReadLoop<'a> {
    source: &'a mut dyn SourceReader,
    sink: &'a mut dyn Sink,
    classifier: SectorClassifier,
    hash: &'a mut RunningHash,
    status: &'a mut dyn StatusCallback,

    sector_size: u32,
    read_sectors: u32,
    max_read_sectors: u32,
    error_mode: ErrorMode,
    retry_count: u32,
    codec: CodecId,
    level: i32,
    /// Present only when the run requested the adaptive-compression A/B
    /// experiment (E); shared with the `SinkCallback` the coordinator
    /// installs so phase timings recorded there feed the same controller
    /// this loop consults before each write.
    compression_ctl: Option<Rc<RefCell<CompressionController>>>,
    write_count: u64,

    low: u64,
    high: Option<u64>,
    direction: Direction,
    state: LoopState,
    counters: Counters,

    consecutive_read_errors: u32,
    consecutive_read_error_regions: u32,
    last_read_short: bool,
    had_valid_reverse_read: bool,
    /// Leftover bytes, short of a full sector, carried from a partial
    /// forward read into the next batch's sector accounting.
    reminder: u32,
}

impl<'a> ReadLoop<'a> {
    pub fn new(
        source: &'a mut dyn SourceReader,
        sink: &'a mut dyn Sink,
        hash: &'a mut RunningHash,
        status: &'a mut dyn StatusCallback,
        cfg: ReadLoopConfig,
        compression_ctl: Option<Rc<RefCell<CompressionController>>>,
    ) -> Self {
        let direction = cfg.starting_direction;
        let state = match direction {
            Direction::Reverse => LoopState::ReverseScanning,
            _ => LoopState::ForwardScanning,
        };
        Self {
            source,
            sink,
            classifier: SectorClassifier::new(cfg.sector_size),
            hash,
            status,
            sector_size: cfg.sector_size,
            read_sectors: cfg.read_sectors,
            max_read_sectors: cfg.max_read_sectors,
            error_mode: cfg.error_mode,
            retry_count: cfg.retry_count.max(1),
            codec: cfg.codec,
            level: cfg.level,
            compression_ctl,
            write_count: 0,
            low: cfg.start_sector,
            high: cfg.total_sectors,
            direction,
            state,
            counters: Counters::default(),
            consecutive_read_errors: 0,
            consecutive_read_error_regions: 0,
            last_read_short: false,
            had_valid_reverse_read: false,
            reminder: 0,
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn hash_invalid(&mut self) -> bool {
        !self.hash.is_valid()
    }

    /// Drive the loop to a terminal state. Only a fatal sink error
    /// unwinds early (spec §7: SinkIOError is always fatal).
    pub fn run(&mut self) -> Result<TerminationReason, AcquireError> {
        loop {
            if let LoopState::Terminated { reason } = &self.state {
                return Ok(reason.clone());
            }
            self.status.on_status(self.direction, self.low, self.high, &self.counters);
            self.step()?;
        }
    }

    fn is_streaming(&self) -> bool {
        self.high.is_none()
    }

    fn window_exhausted(&self) -> bool {
        match self.high {
            Some(h) => self.low >= h,
            None => false,
        }
    }

    fn plan_batch(&self) -> (u64, u64) {
        let requested = if self.max_read_sectors > 0 {
            self.read_sectors.min(self.max_read_sectors)
        } else {
            self.read_sectors
        } as u64;

        match self.direction {
            Direction::Forward => {
                let remaining = match self.high {
                    Some(h) => h.saturating_sub(self.low),
                    None => requested,
                };
                (self.low, requested.min(remaining))
            }
            Direction::Reverse => {
                let high = self.high.expect("reverse requires a known total_sectors");
                let mut start = high.saturating_sub(requested);
                if start < self.low {
                    start = self.low;
                }
                (start, high - start)
            }
            Direction::None => (self.low, 0),
        }
    }

    fn step(&mut self) -> Result<(), AcquireError> {
        if crate::acquire::interrupt::requested() {
            self.state = LoopState::Terminated { reason: TerminationReason::Interrupted };
            return Ok(());
        }

        let (start_sector, batch) = self.plan_batch();
        if batch == 0 {
            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
            return Ok(());
        }

        let offset = start_sector * self.sector_size as u64;
        let buf_len = (batch as usize) * self.sector_size as usize;
        // Pre-filled with the sink's bad-flag marker so any unread tail of
        // a short read still persists as that marker rather than stale
        // heap contents (spec.md §4.6 "buffer preparation").
        let mut buf = vec![self.sink.bad_flag_byte(); buf_len];

        let outcome = self.source.read_at(offset, &mut buf);

        match outcome {
            ReadOutcome::Full(data) => self.handle_full(offset, start_sector, batch, data)?,
            ReadOutcome::Partial { bytes, .. } => self.handle_partial(offset, bytes, buf)?,
            ReadOutcome::Empty => self.handle_empty()?,
            ReadOutcome::Err(_) => self.handle_error_or_short(offset, start_sector, batch, None)?,
        }
        Ok(())
    }

    /// Reposition the sink and write one segment, consulting the
    /// Compression Controller (E) first if the run enabled the adaptive
    /// A/B experiment. Every sink write in the loop goes through here so
    /// the controller sees a consistent, monotonically increasing
    /// segment index.
    fn write_segment(&mut self, offset: u64, data: &[u8]) -> Result<(), AcquireError> {
        if let Some(ctl) = &self.compression_ctl {
            let want_compress = ctl.borrow().compress_this_segment(self.write_count);
            let desired = if want_compress { self.codec } else { CodecId::None };
            if desired != self.sink.compression_type() {
                self.sink.enable_compression(desired, self.level);
            }
        }
        self.sink.seek(offset).map_err(AcquireError::from)?;
        self.sink.write(data).map_err(AcquireError::from)?;
        self.write_count += 1;
        Ok(())
    }

    fn handle_full(
        &mut self,
        offset: u64,
        start_sector: u64,
        batch: u64,
        data: Vec<u8>,
    ) -> Result<(), AcquireError> {
        self.consecutive_read_errors = 0;
        self.consecutive_read_error_regions = 0;

        self.hash.update(offset, &data);
        self.counters.blank_sectors += self.classifier.classify(&data);

        self.write_segment(offset, &data)?;
        self.counters.bytes_written += data.len() as u64;
        self.counters.sectors_read += batch;

        match self.direction {
            Direction::Forward => {
                self.low = start_sector + batch;
                self.last_read_short = false;
                self.state = LoopState::ForwardScanning;
            }
            Direction::Reverse => {
                self.high = Some(start_sector);
                self.had_valid_reverse_read = true;
                self.state = LoopState::ReverseScanning;
            }
            Direction::None => {}
        }

        if self.window_exhausted() {
            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
        }
        Ok(())
    }

    /// `buf` is the full sector-aligned batch the read landed in:
    /// `buf[..bytes]` is genuine source data, `buf[bytes..]` is still the
    /// bad-flag marker `step()` pre-filled it with. Only the genuine
    /// prefix feeds the hash and blank-sector classifier, but the whole
    /// marker-padded sector (up through the one `bytes` lands in) is
    /// what gets persisted, per spec.md §4.6 scenario 4.
    fn handle_partial(&mut self, offset: u64, bytes: usize, buf: Vec<u8>) -> Result<(), AcquireError> {
        if self.direction != Direction::Forward {
            // Not tolerated outside forward phase; treat as an error region.
            let sector = offset / self.sector_size as u64;
            return self.handle_error_or_short(offset, sector, 0, Some(bytes));
        }

        self.consecutive_read_errors = 0;
        self.consecutive_read_error_regions = 0;

        let sector_size = self.sector_size as usize;
        let persisted_len = bytes.div_ceil(sector_size).saturating_mul(sector_size).min(buf.len());
        let persisted = &buf[..persisted_len];

        self.hash.update(offset, &buf[..bytes]);
        self.counters.blank_sectors += self.classifier.classify(&buf[..bytes]);
        self.write_segment(offset, persisted)?;
        self.counters.bytes_written += persisted.len() as u64;

        let total = bytes as u64 + self.reminder as u64;
        let whole_sectors = total / self.sector_size as u64;
        self.reminder = (total % self.sector_size as u64) as u32;
        self.low += whole_sectors;
        self.counters.sectors_read += whole_sectors;
        self.last_read_short = true;
        self.state = LoopState::ForwardScanning;

        if self.is_streaming() && bytes == 0 {
            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
        } else if !self.is_streaming() && self.window_exhausted() {
            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
        }
        Ok(())
    }

    fn handle_empty(&mut self) -> Result<(), AcquireError> {
        if self.is_streaming() {
            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
            return Ok(());
        }
        let (start_sector, batch) = self.plan_batch();
        let offset = start_sector * self.sector_size as u64;
        self.handle_error_or_short(offset, start_sector, batch, None)
    }

    /// Shared retry/skip/give-up/reverse-flip handling for read errors and
    /// (outside forward phase) partial reads.
    fn handle_error_or_short(
        &mut self,
        offset: u64,
        start_sector: u64,
        batch: u64,
        partial_bytes: Option<usize>,
    ) -> Result<(), AcquireError> {
        // Streaming mode (spec.md §4.6): only forward, never retry, never
        // reverse. Any failed or empty read is terminal, regardless of
        // error_mode.
        if self.is_streaming() {
            if let Some(n) = partial_bytes {
                if n > 0 {
                    self.hash.invalidate();
                }
            }
            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
            return Ok(());
        }

        if self.error_mode == ErrorMode::Abort {
            if let Some(n) = partial_bytes {
                if n > 0 {
                    self.hash.invalidate();
                }
            }
            self.hash.invalidate();
            self.state = LoopState::Terminated {
                reason: TerminationReason::AbortedOnError { sector: start_sector },
            };
            return Ok(());
        }

        self.consecutive_read_errors += 1;
        if self.consecutive_read_errors <= self.retry_count {
            self.state = match self.direction {
                Direction::Reverse => LoopState::ReverseRetrying { attempts: self.consecutive_read_errors },
                _ => LoopState::ForwardRetrying { attempts: self.consecutive_read_errors },
            };
            return Ok(());
        }

        // Region budget for retries spent — give up on this region.
        self.consecutive_read_errors = 0;
        let persist_bad = match self.direction {
            Direction::Forward => !self.last_read_short,
            Direction::Reverse => self.had_valid_reverse_read,
            Direction::None => false,
        };

        let region_len = batch.max(1) * self.sector_size as u64;
        if persist_bad {
            self.sink.bad_flag(offset, region_len).map_err(AcquireError::from)?;
            self.counters.sectors_bad += batch.max(1);
            self.hash.invalidate();
        }

        self.consecutive_read_error_regions += 1;
        self.state = match self.direction {
            Direction::Reverse => LoopState::ReverseRegionGiveUp { regions: self.consecutive_read_error_regions },
            _ => LoopState::ForwardRegionGiveUp { regions: self.consecutive_read_error_regions },
        };
        tracing::debug!(offset, region_len, persist_bad, regions = self.consecutive_read_error_regions, "gave up on defect region");

        if self.consecutive_read_error_regions < self.retry_count {
            let bump = (self.read_sectors / 2).max(1) as u64;
            match self.direction {
                Direction::Forward => {
                    let new_low = self.low + bump;
                    if let Some(h) = self.high {
                        if new_low >= h {
                            self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
                            return Ok(());
                        }
                    }
                    self.low = new_low;
                }
                Direction::Reverse => {
                    let h = self.high.unwrap_or(self.low);
                    if h <= self.low + bump {
                        self.state = LoopState::Terminated { reason: TerminationReason::WindowExhausted };
                        return Ok(());
                    }
                    self.high = Some(h - bump);
                }
                Direction::None => {}
            }
            return Ok(());
        }

        // Region budget also spent.
        match self.direction {
            Direction::Forward if self.high.is_some() => {
                self.consecutive_read_errors = 0;
                self.consecutive_read_error_regions = 0;
                self.direction = Direction::Reverse;
                self.hash.invalidate();
                self.state = LoopState::ReverseScanning;
                tracing::info!(low = self.low, high = ?self.high, "forward error budget spent, reversing from tail");
            }
            _ => {
                self.state = LoopState::Terminated { reason: TerminationReason::GaveUpBothDirections };
                tracing::warn!("error budget spent in both directions, giving up");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::sink::NullCallback;
    use crate::acquire::source::test_support::FakeDevice;
    use crate::codec::CodecId;
    use std::io::Cursor;

    struct VecSink {
        data: Vec<u8>,
        pos: u64,
        bad_ranges: Vec<(u64, u64)>,
    }

    impl VecSink {
        fn new() -> Self {
            Self { data: Vec::new(), pos: 0, bad_ranges: Vec::new() }
        }
        fn ensure(&mut self, end: usize) {
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
        }
    }

    impl Sink for VecSink {
        fn set_sector_size(&mut self, _bytes: u32) {}
        fn set_page_size(&mut self, _bytes: u32) {}
        fn set_max_size(&mut self, _bytes: u64) {}
        fn enable_compression(&mut self, _codec: CodecId, _level: i32) {}
        fn set_callback(&mut self, _callback: Box<dyn crate::acquire::sink::SinkCallback>) {}
        fn set_acquisition_date(&mut self, _rfc3339: &str) {}
        fn make_gid(&self) -> String {
            "test".to_string()
        }
        fn seek(&mut self, offset: u64) -> Result<(), SinkError> {
            self.pos = offset;
            Ok(())
        }
        fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
            let end = self.pos as usize + data.len();
            self.ensure(end);
            self.data[self.pos as usize..end].copy_from_slice(data);
            self.pos += data.len() as u64;
            Ok(())
        }
        fn tell(&self) -> u64 {
            self.pos
        }
        fn bad_flag(&mut self, offset: u64, length: u64) -> Result<(), SinkError> {
            self.bad_ranges.push((offset, length));
            let end = offset as usize + length as usize;
            self.ensure(end);
            Ok(())
        }
        fn bad_flag_byte(&self) -> u8 {
            0
        }
        fn has_page(&self, offset: u64) -> bool {
            (offset as usize) < self.data.len()
        }
        fn update_seg(&mut self, _name: &str, _value: &[u8]) -> Result<(), SinkError> {
            Ok(())
        }
        fn get_seg(&self, _name: &str) -> Option<Vec<u8>> {
            None
        }
        fn del_seg(&mut self, _name: &str) -> Result<(), SinkError> {
            Ok(())
        }
        fn compression_type(&self) -> CodecId {
            CodecId::None
        }
        fn finalize(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn clean_source_reads_every_sector_forward() {
        let sector_size = 512u32;
        let total_sectors = 8u64;
        let image = vec![7u8; (sector_size as u64 * total_sectors) as usize];
        let mut source = FakeDevice::new(image.clone(), sector_size);
        let mut sink = VecSink::new();
        let mut hash = RunningHash::new(0, true);
        let mut status = NullStatus;

        let cfg = ReadLoopConfig {
            start_sector: 0,
            total_sectors: Some(total_sectors),
            starting_direction: Direction::Forward,
            read_sectors: 4,
            max_read_sectors: 0,
            error_mode: ErrorMode::Recover,
            retry_count: 3,
            sector_size,
            codec: CodecId::None,
            level: 0,
        };

        let mut loop_ = ReadLoop::new(&mut source, &mut sink, &mut hash, &mut status, cfg, None);
        let reason = loop_.run().unwrap();
        assert_eq!(reason, TerminationReason::WindowExhausted);
        assert_eq!(loop_.counters().sectors_read, total_sectors);
        assert!(!loop_.hash_invalid());
        assert_eq!(sink.data, image);
    }

    #[test]
    fn bad_region_gets_marked_and_hash_invalidated() {
        let sector_size = 512u32;
        let total_sectors = 8u64;
        let image = vec![3u8; (sector_size as u64 * total_sectors) as usize];
        let mut source = FakeDevice::new(image, sector_size);
        source.bad_sectors.insert(2);
        source.bad_sectors.insert(3);

        let mut sink = VecSink::new();
        let mut hash = RunningHash::new(0, true);
        let mut status = NullStatus;

        let cfg = ReadLoopConfig {
            start_sector: 0,
            total_sectors: Some(total_sectors),
            starting_direction: Direction::Forward,
            read_sectors: 1,
            max_read_sectors: 0,
            error_mode: ErrorMode::Recover,
            retry_count: 2,
            sector_size,
            codec: CodecId::None,
            level: 0,
        };

        let mut loop_ = ReadLoop::new(&mut source, &mut sink, &mut hash, &mut status, cfg, None);
        let _ = loop_.run().unwrap();
        assert!(loop_.hash_invalid());
        assert!(loop_.counters().sectors_bad > 0);
    }

    #[test]
    fn abort_mode_terminates_on_first_error() {
        let sector_size = 512u32;
        let total_sectors = 4u64;
        let image = vec![1u8; (sector_size as u64 * total_sectors) as usize];
        let mut source = FakeDevice::new(image, sector_size);
        source.bad_sectors.insert(1);

        let mut sink = VecSink::new();
        let mut hash = RunningHash::new(0, true);
        let mut status = NullStatus;

        let cfg = ReadLoopConfig {
            start_sector: 0,
            total_sectors: Some(total_sectors),
            starting_direction: Direction::Forward,
            read_sectors: 1,
            max_read_sectors: 0,
            error_mode: ErrorMode::Abort,
            retry_count: 3,
            sector_size,
            codec: CodecId::None,
            level: 0,
        };

        let mut loop_ = ReadLoop::new(&mut source, &mut sink, &mut hash, &mut status, cfg, None);
        let reason = loop_.run().unwrap();
        assert!(matches!(reason, TerminationReason::AbortedOnError { .. }));
    }

    #[test]
    fn streaming_error_terminates_immediately_without_retry() {
        let sector_size = 512u32;
        let image = vec![5u8; (sector_size as u64 * 4) as usize];
        let mut source = FakeDevice::new(image, sector_size);
        source.bad_sectors.insert(0);

        let mut sink = VecSink::new();
        let mut hash = RunningHash::new(0, true);
        let mut status = NullStatus;

        let cfg = ReadLoopConfig {
            start_sector: 0,
            total_sectors: None,
            starting_direction: Direction::Forward,
            read_sectors: 2,
            max_read_sectors: 0,
            error_mode: ErrorMode::Recover,
            retry_count: 3,
            sector_size,
            codec: CodecId::None,
            level: 0,
        };

        let mut loop_ = ReadLoop::new(&mut source, &mut sink, &mut hash, &mut status, cfg, None);
        loop_.step().unwrap();

        assert_eq!(loop_.state, LoopState::Terminated { reason: TerminationReason::WindowExhausted });
        assert_eq!(loop_.counters().sectors_read, 0);
        assert_eq!(loop_.counters().sectors_bad, 0);
    }

    #[test]
    fn short_read_persists_full_sector_padded_with_marker() {
        let sector_size = 512u32;
        let data = vec![9u8; 440];
        let mut source = FakeDevice::new(data.clone(), sector_size);

        let mut sink = VecSink::new();
        let mut hash = RunningHash::new(0, true);
        let mut status = NullStatus;

        let cfg = ReadLoopConfig {
            start_sector: 0,
            total_sectors: None,
            starting_direction: Direction::Forward,
            read_sectors: 1,
            max_read_sectors: 0,
            error_mode: ErrorMode::Recover,
            retry_count: 3,
            sector_size,
            codec: CodecId::None,
            level: 0,
        };

        let mut loop_ = ReadLoop::new(&mut source, &mut sink, &mut hash, &mut status, cfg, None);
        loop_.step().unwrap();

        assert_eq!(sink.data.len(), sector_size as usize);
        assert_eq!(&sink.data[..440], &data[..]);
        assert!(sink.data[440..].iter().all(|&b| b == 0));
        assert_eq!(loop_.counters().bytes_written, sector_size as u64);
        assert_eq!(loop_.counters().sectors_read, 0);
        assert!(!loop_.hash_invalid());
    }
}
