//! Acquisition Coordinator (H) — spec.md §4.8.
//!
//! Owns the per-source lifecycle end to end: resolve output path, open
//! source and sink, prime metadata, install the compression callback,
//! run the Read Loop (F) or Recover-Scan (G), finalize hashes and
//! counters, close. One `Coordinator::run` call per source; re-entry is
//! not supported, matching spec.md §3's "Re-entry is not supported."

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::acquire::compression_ctl::CompressionController;
use crate::acquire::hash::RunningHash;
use crate::acquire::ident::{DeviceIdent, DmesgSource, KernelLogSource, MacAddressSource, NoDeviceIdent, SysfsMacSource};
use crate::acquire::lock::RunLock;
use crate::acquire::metadata::*;
use crate::acquire::model::{Direction, SourceKind};
use crate::acquire::read_loop::{NullStatus, ReadLoop, ReadLoopConfig, StatusCallback};
use crate::acquire::recover_scan::run_recover_scan;
use crate::acquire::sink::{Phase, Sink, SinkCallback};
use crate::acquire::sixcy_sink::SixcySink;
use crate::acquire::source::{open_source, DeviceProbe, StdDeviceProbe};
use crate::config::AcquireConfig;
use crate::error::AcquireError;

/// Forwards phase notifications from the sink into the shared
/// `CompressionController`, and separately into counter bookkeeping.
/// Installed by the Coordinator per Design Notes §9's "small trait
/// object installed by the engine" resolution to the sink/engine
/// callback cycle.
struct EngineCallback {
    ctl: Rc<RefCell<CompressionController>>,
}

impl SinkCallback for EngineCallback {
    fn on_phase(&mut self, page_index: u64, phase: Phase) {
        self.ctl.borrow_mut().on_phase(page_index, phase);
    }
}

/// Final outcome of a `Coordinator::run` call, reported to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub output_path: String,
    pub termination: String,
    pub total_sectors_read: u64,
    pub bad_sectors_read: u64,
    pub blank_sectors: u64,
    pub bytes_written: u64,
    pub elapsed_seconds: f64,
    pub hash_invalid: bool,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl AcquisitionReport {
    /// Human-readable final block per spec.md §7's reporting requirement.
    pub fn summary(&self) -> String {
        let digests = if self.hash_invalid {
            "THIS DRIVE COULD NOT BE IMAGED (digests unavailable)".to_string()
        } else {
            format!(
                "md5={}\n  sha1={}\n  sha256={}",
                self.md5.as_deref().unwrap_or("-"),
                self.sha1.as_deref().unwrap_or("-"),
                self.sha256.as_deref().unwrap_or("-"),
            )
        };
        format!(
            "output: {}\n  termination: {}\n  sectors read: {}  bad: {}  blank: {}\n  bytes written: {}\n  elapsed: {:.2}s\n  {}",
            self.output_path,
            self.termination,
            self.total_sectors_read,
            self.bad_sectors_read,
            self.blank_sectors,
            self.bytes_written,
            self.elapsed_seconds,
            digests,
        )
    }
}

/// Drives a single acquisition from configuration to report. The
/// embedded `command_line` is stored verbatim in the archive's
/// metadata segment (spec.md §6.4).
pub struct Coordinator {
    config: AcquireConfig,
    command_line: String,
    lock_dir: PathBuf,
    probe: Box<dyn DeviceProbe>,
    ident: Box<dyn DeviceIdent>,
    mac_source: Box<dyn MacAddressSource>,
    kernel_log_source: Box<dyn KernelLogSource>,
}

impl Coordinator {
    pub fn new(config: AcquireConfig, command_line: String) -> Self {
        Self {
            config,
            command_line,
            lock_dir: std::env::temp_dir().join("forenscan-locks"),
            probe: Box::new(StdDeviceProbe),
            ident: Box::new(NoDeviceIdent),
            mac_source: Box::new(SysfsMacSource),
            kernel_log_source: Box::new(DmesgSource),
        }
    }

    /// Resolve `template` against existing files when it contains `%d`,
    /// per spec.md §4.8 step 1: "scan the directory for existing matches
    /// and pick the next integer."
    fn resolve_output_path(template: &str) -> Result<PathBuf, AcquireError> {
        if !template.contains("%d") {
            return Ok(PathBuf::from(template));
        }
        let mut n = 0u32;
        loop {
            let candidate = template.replacen("%d", &n.to_string(), 1);
            if !Path::new(&candidate).exists() {
                return Ok(PathBuf::from(candidate));
            }
            n += 1;
        }
    }

    fn source_kind(&self) -> Result<SourceKind, AcquireError> {
        let input = &self.config.input;
        if input == "-" {
            Ok(SourceKind::Stdin)
        } else if let Some(port) = input.strip_prefix("listen:") {
            let port = port
                .parse::<u16>()
                .map_err(|_| crate::error::ConfigError::Invalid(format!("bad listen port: {port}")))?;
            Ok(SourceKind::Listener { port })
        } else {
            let path = PathBuf::from(input);
            let is_regular = path.is_file();
            if is_regular {
                Ok(SourceKind::RegularFile(path))
            } else {
                Ok(SourceKind::BlockDevice(path))
            }
        }
    }

    /// Run a fresh acquisition (spec.md §4.8, not recover-scan).
    pub fn run(&self) -> Result<AcquisitionReport, AcquireError> {
        let output_path = Self::resolve_output_path(&self.config.output)?;
        if output_path.exists() && !self.config.recover_scan {
            // append-mode collision check: spec.md §4.8 step 1 and Design
            // Notes §9(c) — fail fast rather than silently continue.
            return Err(crate::error::ConfigError::OutputExists(output_path.display().to_string()).into());
        }

        let kind = self.source_kind()?;
        let mut source = open_source(&kind, self.config.allow_regular_file, self.probe.as_ref())
            .map_err(AcquireError::from)?;
        let geometry = source.geometry();

        let source_size_known = geometry.total_sectors > 0;
        self.config.validate(geometry.sector_size, source_size_known)?;

        let lock_key = self.config.input.clone();
        let _lock = RunLock::acquire(&self.lock_dir, &lock_key)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&output_path)
            .map_err(crate::error::SinkError::from)?;
        let mut sink = SixcySink::new(file).map_err(crate::error::SinkError::from)?;

        self.prime_sink(&mut sink, &kind, &geometry)?;

        let compression_ctl = if self.config.adaptive_compress {
            Some(Rc::new(RefCell::new(CompressionController::new())))
        } else {
            None
        };
        if let Some(ctl) = &compression_ctl {
            sink.set_callback(Box::new(EngineCallback { ctl: Rc::clone(ctl) }));
        } else {
            let codec = if self.config.no_compress { crate::codec::CodecId::None } else { self.config.codec };
            sink.enable_compression(codec, self.config.compression_level);
        }

        let start = Instant::now();
        let mut hash = if self.config.no_hash {
            RunningHash::new(0, false)
        } else if self.config.multithread_hash {
            RunningHash::new_threaded(0)
        } else {
            RunningHash::new(0, true)
        };
        let mut status = NullStatus;

        let total_sectors = if source_size_known { Some(geometry.total_sectors) } else { None };
        let skip_sectors = self.config.skip_bytes / geometry.sector_size as u64;
        let starting_direction = if self.config.reverse_start { Direction::Reverse } else { Direction::Forward };

        let codec = if self.config.no_compress { crate::codec::CodecId::None } else { self.config.codec };
        let cfg = ReadLoopConfig {
            start_sector: skip_sectors,
            total_sectors,
            starting_direction,
            read_sectors: self.config.read_sectors,
            max_read_sectors: geometry.max_read_sectors,
            error_mode: self.config.error_mode,
            retry_count: self.config.retry_count,
            sector_size: geometry.sector_size,
            codec,
            level: self.config.compression_level,
        };

        let mut read_loop = ReadLoop::new(
            &mut *source,
            &mut sink,
            &mut hash,
            &mut status as &mut dyn StatusCallback,
            cfg,
            compression_ctl,
        );
        let termination = read_loop.run()?;
        let counters = read_loop.counters().clone();
        let hash_invalid = read_loop.hash_invalid();
        let elapsed = start.elapsed();
        tracing::info!(?termination, sectors_read = counters.sectors_read, sectors_bad = counters.sectors_bad, elapsed_s = elapsed.as_secs_f64(), "acquisition loop finished");

        let digests = self.finalize(&mut sink, hash, hash_invalid, &counters, elapsed)?;
        sink.finalize().map_err(AcquireError::from)?;

        Ok(AcquisitionReport {
            output_path: output_path.display().to_string(),
            termination: format!("{termination:?}"),
            total_sectors_read: counters.sectors_read,
            bad_sectors_read: counters.sectors_bad,
            blank_sectors: counters.blank_sectors,
            bytes_written: counters.bytes_written,
            elapsed_seconds: elapsed.as_secs_f64(),
            hash_invalid,
            md5: digests.md5,
            sha1: digests.sha1,
            sha256: digests.sha256,
        })
    }

    /// Drive Recover-Scan (G) over an existing archive rather than a
    /// fresh source. Returns a report with no hash fields populated,
    /// per spec.md §4.7's "no hash updates are attempted."
    pub fn run_recover_scan(&self) -> Result<AcquisitionReport, AcquireError> {
        let archive_path = PathBuf::from(&self.config.output);
        let kind = self.source_kind()?;
        let mut source = open_source(&kind, self.config.allow_regular_file, self.probe.as_ref())
            .map_err(AcquireError::from)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&archive_path)
            .map_err(crate::error::SinkError::from)?;
        let mut sink = SixcySink::open_existing(file).map_err(crate::error::SinkError::from)?;
        let (sector_size, page_size, _max_size, declared_size) = sink.prime_geometry();
        let total_sectors = declared_size / sector_size.max(1) as u64;

        let start = Instant::now();
        let report = run_recover_scan(
            &mut *source,
            &mut sink,
            sector_size,
            page_size,
            total_sectors,
            self.config.retry_count,
        )?;
        let elapsed = start.elapsed();

        sink.update_seg(SEG_BAD_SECTORS, &report.sectors_bad.to_le_bytes()).map_err(AcquireError::from)?;
        sink.finalize().map_err(AcquireError::from)?;

        Ok(AcquisitionReport {
            output_path: archive_path.display().to_string(),
            termination: format!("RecoverScan {{ pages_recovered: {}, pages_still_missing: {} }}", report.pages_recovered, report.pages_still_missing),
            total_sectors_read: report.sectors_read,
            bad_sectors_read: report.sectors_bad,
            blank_sectors: 0,
            bytes_written: report.bytes_written,
            elapsed_seconds: elapsed.as_secs_f64(),
            hash_invalid: true,
            md5: None,
            sha1: None,
            sha256: None,
        })
    }

    fn prime_sink(
        &self,
        sink: &mut SixcySink<std::fs::File>,
        kind: &SourceKind,
        geometry: &crate::acquire::source::Geometry,
    ) -> Result<(), AcquireError> {
        sink.set_sector_size(geometry.sector_size);
        sink.set_page_size(self.config.page_size);
        sink.set_max_size(self.config.max_size);
        sink.set_acquisition_date(&chrono::Utc::now().to_rfc3339());

        sink.update_seg(SEG_COMMAND_LINE, self.command_line.as_bytes()).map_err(AcquireError::from)?;
        sink.update_seg(SEG_DEVICE, self.config.input.as_bytes()).map_err(AcquireError::from)?;
        sink.update_seg(SEG_DEVICE_SECTORS, &geometry.total_sectors.to_le_bytes()).map_err(AcquireError::from)?;

        if let Some(case) = &self.config.case_number {
            sink.update_seg(SEG_CASE_NUMBER, case.as_bytes()).map_err(AcquireError::from)?;
        }
        if let Some(tech) = &self.config.technician {
            sink.update_seg(SEG_TECHNICIAN, tech.as_bytes()).map_err(AcquireError::from)?;
        }

        if let SourceKind::BlockDevice(path) = kind {
            let identity = self.ident.identify(&path.to_string_lossy());
            if let Some(v) = &identity.manufacturer {
                sink.update_seg(SEG_DEVICE_MANUFACTURER, v.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(v) = &identity.model {
                sink.update_seg(SEG_DEVICE_MODEL, v.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(v) = &identity.serial {
                sink.update_seg(SEG_DEVICE_SERIAL, v.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(v) = &identity.firmware {
                sink.update_seg(SEG_DEVICE_FIRMWARE, v.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(v) = &identity.capabilities {
                sink.update_seg(SEG_DEVICE_CAPABILITIES, v.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(c) = identity.cylinders {
                sink.update_seg(SEG_CYLINDERS, &c.to_le_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(h) = identity.heads {
                sink.update_seg(SEG_HEADS, &h.to_le_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(s) = identity.sectors_per_track {
                sink.update_seg(SEG_SECTORS_PER_TRACK, &s.to_le_bytes()).map_err(AcquireError::from)?;
            }
        }

        if self.config.collect_mac_addresses {
            let macs = self.mac_source.mac_addresses().join(",");
            if !macs.is_empty() {
                sink.update_seg(SEG_MAC_ADDRESSES, macs.as_bytes()).map_err(AcquireError::from)?;
            }
        }
        if self.config.collect_kernel_log {
            if let Some(log) = self.kernel_log_source.kernel_log() {
                sink.update_seg(SEG_KERNEL_LOG, log.as_bytes()).map_err(AcquireError::from)?;
            }
        }

        Ok(())
    }

    /// spec.md §4.8 step 7: store digests iff `hash_invalid == false`,
    /// always store bad/blank counts and elapsed seconds. Returns the
    /// computed digests so the caller can surface them in the report.
    fn finalize(
        &self,
        sink: &mut SixcySink<std::fs::File>,
        hash: RunningHash,
        hash_invalid: bool,
        counters: &crate::acquire::model::Counters,
        elapsed: std::time::Duration,
    ) -> Result<crate::acquire::hash::HashDigests, AcquireError> {
        let digests = hash.finish();
        if !hash_invalid {
            if let Some(md5) = &digests.md5 {
                sink.update_seg(SEG_MD5, md5.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(sha1) = &digests.sha1 {
                sink.update_seg(SEG_SHA1, sha1.as_bytes()).map_err(AcquireError::from)?;
            }
            if let Some(sha256) = &digests.sha256 {
                sink.update_seg(SEG_SHA256, sha256.as_bytes()).map_err(AcquireError::from)?;
            }
        } else {
            for seg in DIGEST_SEGMENTS {
                sink.del_seg(seg).map_err(AcquireError::from)?;
            }
        }

        sink.update_seg(SEG_BAD_SECTORS, &counters.sectors_bad.to_le_bytes()).map_err(AcquireError::from)?;
        sink.update_seg(SEG_BLANK_SECTORS, &counters.blank_sectors.to_le_bytes()).map_err(AcquireError::from)?;
        sink.update_seg(SEG_ACQUISITION_SECONDS, &elapsed.as_secs_f64().to_le_bytes()).map_err(AcquireError::from)?;
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn output_exists_refuses_without_recover_scan() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("image.6cy");
        std::fs::write(&out, b"occupied").unwrap();

        let mut config = AcquireConfig::default();
        config.input = dir.path().join("missing-device").to_string_lossy().into_owned();
        config.output = out.to_string_lossy().into_owned();

        let coordinator = Coordinator::new(config, "forenscan acquire".to_string());
        let err = coordinator.run().unwrap_err();
        assert!(matches!(err, AcquireError::Config(crate::error::ConfigError::OutputExists(_))));
    }

    #[test]
    fn percent_d_template_picks_next_free_integer() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("image-0.6cy"), b"x").unwrap();
        std::fs::write(dir.path().join("image-1.6cy"), b"x").unwrap();
        let template = dir.path().join("image-%d.6cy");
        let resolved = Coordinator::resolve_output_path(&template.to_string_lossy()).unwrap();
        assert_eq!(resolved, dir.path().join("image-2.6cy"));
    }
}
