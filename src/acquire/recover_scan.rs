//! Recover-Scan Mode (G) — spec.md §4.7.
//!
//! An alternate driver over the Read Loop (F) that targets only the
//! pages missing from an existing, possibly interrupted archive, rather
//! than walking the whole source again. Grounded on
//! `original_source/src/imager.cpp::start_recover_scan`: compute
//! `sectors_per_page`/`num_pages`, probe each page's presence via the
//! sink, shuffle the missing set, then drive one `ReadLoop` invocation
//! per missing page with `error_mode = Abort` so a still-defective page
//! is skipped rather than chased with full retry/reverse machinery.

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::acquire::hash::RunningHash;
use crate::acquire::model::{Direction, ErrorMode};
use crate::acquire::read_loop::{NullStatus, ReadLoop, ReadLoopConfig};
use crate::acquire::sink::Sink;
use crate::acquire::source::SourceReader;
use crate::codec::CodecId;
use crate::error::AcquireError;

/// Tally returned to the Coordinator; no hash fields here — spec.md
/// §4.7's "no hash updates are attempted" since the archive's existing
/// digests, if any, are already considered invalid by recover-mode.
#[derive(Debug, Clone, Default)]
pub struct RecoverScanReport {
    pub pages_recovered: u64,
    pub pages_still_missing: u64,
    pub sectors_read: u64,
    pub sectors_bad: u64,
    pub bytes_written: u64,
}

/// Drive recover-scan against `sink`'s existing page table, reading
/// `total_sectors` at `sector_size` in pages of `page_size` bytes.
pub fn run_recover_scan(
    source: &mut dyn SourceReader,
    sink: &mut dyn Sink,
    sector_size: u32,
    page_size: u32,
    total_sectors: u64,
    retry_count: u32,
) -> Result<RecoverScanReport, AcquireError> {
    let sectors_per_page = (page_size / sector_size).max(1) as u64;
    let num_pages = total_sectors.div_ceil(sectors_per_page);

    let mut missing: Vec<u64> = (0..num_pages)
        .filter(|&page_index| {
            let offset = page_index * sectors_per_page * sector_size as u64;
            !sink.has_page(offset)
        })
        .collect();
    missing.shuffle(&mut thread_rng());

    let mut report = RecoverScanReport::default();
    let mut hash = RunningHash::new(0, false);
    let mut status = NullStatus;

    let mut remaining = missing.len() as u64;
    for page_index in missing {
        if crate::acquire::interrupt::requested() {
            report.pages_still_missing += remaining;
            break;
        }
        remaining -= 1;
        let low = page_index * sectors_per_page;
        let high = (low + sectors_per_page).min(total_sectors);
        if low >= high {
            continue;
        }

        let cfg = ReadLoopConfig {
            start_sector: low,
            total_sectors: Some(high),
            starting_direction: Direction::Forward,
            read_sectors: sectors_per_page as u32,
            max_read_sectors: 0,
            error_mode: ErrorMode::Abort,
            retry_count,
            sector_size,
            codec: CodecId::None,
            level: 0,
        };

        let mut read_loop = ReadLoop::new(source, sink, &mut hash, &mut status, cfg, None);
        let _ = read_loop.run()?;
        let counters = read_loop.counters();

        report.sectors_read += counters.sectors_read;
        report.sectors_bad += counters.sectors_bad;
        report.bytes_written += counters.bytes_written;

        let offset = low * sector_size as u64;
        if sink.has_page(offset) {
            report.pages_recovered += 1;
        } else {
            report.pages_still_missing += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::source::test_support::FakeDevice;

    struct VecSink {
        data: Vec<u8>,
        pos: u64,
        written_offsets: std::collections::HashSet<u64>,
    }

    impl VecSink {
        fn new(len: usize) -> Self {
            Self { data: vec![0u8; len], pos: 0, written_offsets: std::collections::HashSet::new() }
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
        fn seek(&mut self, offset: u64) -> Result<(), crate::error::SinkError> {
            self.pos = offset;
            Ok(())
        }
        fn write(&mut self, data: &[u8]) -> Result<(), crate::error::SinkError> {
            let end = self.pos as usize + data.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[self.pos as usize..end].copy_from_slice(data);
            self.written_offsets.insert(self.pos);
            self.pos += data.len() as u64;
            Ok(())
        }
        fn tell(&self) -> u64 {
            self.pos
        }
        fn bad_flag(&mut self, _offset: u64, _length: u64) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
        fn bad_flag_byte(&self) -> u8 {
            0
        }
        fn has_page(&self, offset: u64) -> bool {
            self.written_offsets.contains(&offset)
        }
        fn update_seg(&mut self, _name: &str, _value: &[u8]) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
        fn get_seg(&self, _name: &str) -> Option<Vec<u8>> {
            None
        }
        fn del_seg(&mut self, _name: &str) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
        fn compression_type(&self) -> CodecId {
            CodecId::None
        }
        fn finalize(&mut self) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
    }

    #[test]
    fn fills_in_every_missing_page() {
        let sector_size = 512u32;
        let page_size = 1024u32; // 2 sectors per page
        let total_sectors = 8u64;
        let image = vec![9u8; (sector_size as u64 * total_sectors) as usize];
        let mut source = FakeDevice::new(image.clone(), sector_size);
        let mut sink = VecSink::new(image.len());

        // Pretend pages 0 and 2 were already captured by a prior run.
        sink.written_offsets.insert(0);
        sink.written_offsets.insert(2 * 1024);

        let report =
            run_recover_scan(&mut source, &mut sink, sector_size, page_size, total_sectors, 3).unwrap();

        assert_eq!(report.pages_still_missing, 0);
        assert_eq!(report.pages_recovered, 2);
        assert!(sink.has_page(1024));
        assert!(sink.has_page(3 * 1024));
    }

    #[test]
    fn defective_page_is_skipped_not_chased() {
        let sector_size = 512u32;
        let page_size = 512u32; // 1 sector per page
        let total_sectors = 4u64;
        let image = vec![1u8; (sector_size as u64 * total_sectors) as usize];
        let mut source = FakeDevice::new(image, sector_size);
        source.bad_sectors.insert(1);
        let mut sink = VecSink::new((sector_size as u64 * total_sectors) as usize);

        let report =
            run_recover_scan(&mut source, &mut sink, sector_size, page_size, total_sectors, 3).unwrap();

        assert_eq!(report.pages_recovered, 3);
        assert_eq!(report.pages_still_missing, 1);
        assert!(!sink.has_page(512));
    }
}
