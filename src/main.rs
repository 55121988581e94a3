use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use forenscan::acquire::interrupt;
use forenscan::acquire::model::ErrorMode;
use forenscan::codec::CodecId;
use forenscan::config::AcquireConfig;
use forenscan::{AcquireError, Coordinator};

#[derive(Parser)]
#[command(name = "forenscan", version, about = "Forensic block-device acquisition engine")]
struct Cli {
    /// Path to an optional TOML config file; CLI flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a forensic image of a device, file, stdin, or listen:<port>.
    Acquire {
        /// Device path, `-` for stdin, or `listen:<port>`.
        input: String,
        /// Output archive path. May contain one `%d` placeholder.
        #[arg(short, long)]
        output: String,
        /// Skip offset in bytes; must be a multiple of the sector size.
        #[arg(long, default_value_t = 0)]
        skip: u64,
        /// Start the read loop in reverse instead of forward.
        #[arg(long)]
        reverse: bool,
        /// 0 = recover (retry/skip/reverse), 1 = abort on first error.
        #[arg(long = "error-mode", default_value_t = 0)]
        error_mode: u8,
        /// Retries tolerated per defect region before giving up on it.
        #[arg(long = "retry-count", default_value_t = forenscan::config::DEFAULT_RETRY_COUNT)]
        retry_count: u32,
        /// Sectors requested per read call.
        #[arg(long = "read-sectors", default_value_t = forenscan::config::DEFAULT_READ_SECTORS)]
        read_sectors: u32,
        /// Sink page size in bytes.
        #[arg(long = "page-size", default_value_t = forenscan::io_stream::DEFAULT_CHUNK_SIZE as u32)]
        page_size: u32,
        /// Cap on archive size: plain bytes, or a suffix k/m/g/cd/bigcd/dvd/dvddl.
        #[arg(long = "max-size", default_value = "0")]
        max_size: String,
        /// Compression algorithm: none, zstd, lz4, brotli, lzma.
        #[arg(long, default_value = "zstd")]
        codec: String,
        /// Compression level passed to the codec.
        #[arg(long, default_value_t = forenscan::io_stream::DEFAULT_COMPRESSION_LEVEL)]
        level: i32,
        /// Disable compression entirely.
        #[arg(long = "no-compress")]
        no_compress: bool,
        /// Run the one-shot A/B adaptive-compression experiment.
        #[arg(long = "adaptive-compress")]
        adaptive_compress: bool,
        /// Skip all hashing.
        #[arg(long = "no-hash")]
        no_hash: bool,
        /// Hash on an auxiliary thread via a bounded hand-off (reserved;
        /// see DESIGN.md for the current single-threaded fallback).
        #[arg(long = "multithread-hash")]
        multithread_hash: bool,
        /// Allow imaging a regular file instead of a block device.
        #[arg(long = "allow-regular-file")]
        allow_regular_file: bool,
        /// Exit immediately on the first interrupt instead of closing
        /// the sink gracefully first.
        #[arg(long = "fast-quit")]
        fast_quit: bool,
        /// Technician-entered case metadata, stored verbatim in the archive.
        #[arg(long = "case-number")]
        case_number: Option<String>,
        #[arg(long)]
        technician: Option<String>,
        /// Skip best-effort MAC address collection.
        #[arg(long = "no-mac-addresses")]
        no_mac_addresses: bool,
        /// Skip best-effort kernel ring buffer capture.
        #[arg(long = "no-kernel-log")]
        no_kernel_log: bool,
    },
    /// Drive Recover-Scan Mode over an existing, partially-populated archive.
    RecoverScan {
        /// Device path, `-` for stdin, or `listen:<port>` to read from.
        input: String,
        /// Existing archive path to fill in.
        archive: String,
        #[arg(long = "retry-count", default_value_t = forenscan::config::DEFAULT_RETRY_COUNT)]
        retry_count: u32,
        #[arg(long = "allow-regular-file")]
        allow_regular_file: bool,
    },
    /// Index-bypass diagnostic scan of an archive (does not redo acquisition).
    Verify { archive: PathBuf },
    /// Print an archive's acquisition metadata segments.
    Info { archive: PathBuf },
}

/// Set by `acquire --fast-quit` before the read loop starts; read by the
/// interrupt handler installed once at the top of `main`.
static FAST_QUIT: AtomicBool = AtomicBool::new(false);

fn main() {
    let cli = Cli::parse();
    forenscan::logging::init();
    install_interrupt_handler();

    let result = match cli.command {
        Commands::Acquire { .. } => run_acquire(cli.config.as_deref(), cli.command),
        Commands::RecoverScan { .. } => run_recover_scan(cli.command),
        Commands::Verify { archive } => run_verify(&archive),
        Commands::Info { archive } => run_info(&archive),
    };

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

/// First SIGINT closes the sink gracefully (the read loop observes
/// [`interrupt::requested`] and terminates; the Coordinator finalizes and
/// closes unconditionally afterward — see spec.md §4.8). A second signal,
/// or `--fast-quit`, exits immediately. Installed once at startup so it
/// covers every subcommand, per spec.md §5's "the interrupt handler must
/// tolerate both null and valid states" — there may be no acquisition in
/// flight at all when it fires.
fn install_interrupt_handler() {
    let _ = ctrlc::set_handler(move || {
        let is_second = interrupt::signal();
        if is_second || FAST_QUIT.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\ninterrupt received, closing archive gracefully (press again to force quit)...");
    });
}

fn load_config(config_path: Option<&std::path::Path>) -> Result<AcquireConfig, AcquireError> {
    match config_path {
        Some(p) => Ok(AcquireConfig::from_toml_file(p)?),
        None => Ok(AcquireConfig::default()),
    }
}

fn run_acquire(config_path: Option<&std::path::Path>, command: Commands) -> Result<(), AcquireError> {
    let Commands::Acquire {
        input,
        output,
        skip,
        reverse,
        error_mode,
        retry_count,
        read_sectors,
        page_size,
        max_size,
        codec,
        level,
        no_compress,
        adaptive_compress,
        no_hash,
        multithread_hash,
        allow_regular_file,
        fast_quit,
        case_number,
        technician,
        no_mac_addresses,
        no_kernel_log,
    } = command
    else {
        unreachable!("run_acquire called with a non-Acquire command")
    };

    FAST_QUIT.store(fast_quit, Ordering::SeqCst);

    let mut config = load_config(config_path)?;
    config.input = input;
    config.output = output;
    config.skip_bytes = skip;
    config.reverse_start = reverse;
    config.error_mode = if error_mode == 1 { ErrorMode::Abort } else { ErrorMode::Recover };
    config.retry_count = retry_count;
    config.read_sectors = read_sectors;
    config.page_size = page_size;
    config.max_size = parse_size(&max_size)
        .ok_or_else(|| forenscan::error::ConfigError::Invalid(format!("bad --max-size value: {max_size}")))?;
    config.codec = CodecId::from_name(&codec)
        .ok_or_else(|| forenscan::error::ConfigError::Invalid(format!("unknown codec: {codec}")))?;
    config.compression_level = level;
    config.no_compress = no_compress;
    config.adaptive_compress = adaptive_compress;
    config.no_hash = no_hash;
    config.multithread_hash = multithread_hash;
    config.allow_regular_file = allow_regular_file;
    config.recover_scan = false;
    config.case_number = case_number;
    config.technician = technician;
    config.collect_mac_addresses = !no_mac_addresses;
    config.collect_kernel_log = !no_kernel_log;
    config.fast_quit = fast_quit;

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let coordinator = Coordinator::new(config, command_line);
    let report = coordinator.run()?;

    println!("{}", report.summary());
    if report.hash_invalid {
        std::process::exit(2);
    }
    Ok(())
}

fn run_recover_scan(command: Commands) -> Result<(), AcquireError> {
    let Commands::RecoverScan { input, archive, retry_count, allow_regular_file } = command else {
        unreachable!("run_recover_scan called with a non-RecoverScan command")
    };

    let mut config = AcquireConfig::default();
    config.input = input;
    config.output = archive;
    config.retry_count = retry_count;
    config.allow_regular_file = allow_regular_file;
    config.recover_scan = true;

    let coordinator = Coordinator::new(config, std::env::args().collect::<Vec<_>>().join(" "));
    let report = coordinator.run_recover_scan()?;
    println!("{}", report.summary());
    Ok(())
}

/// Thin wrapper over the index-bypass scanner already shipped for the
/// container format (`recovery::scan_file`). This is a diagnostic pass
/// over the archive's own block structure, not a re-verification of the
/// source device — spec.md §1 places acquisition-time verification out
/// of scope, and SPEC_FULL.md §9 keeps this exposed because the
/// functionality already exists and costs nothing to surface.
fn run_verify(archive: &std::path::Path) -> Result<(), AcquireError> {
    let report = forenscan::recovery::scan_file(archive)?;
    println!("{}", report.summary());
    println!("  blocks scanned:   {}", report.total_scanned);
    println!("  healthy blocks:   {}", report.healthy_blocks);
    println!("  corrupt blocks:   {}", report.corrupt_blocks);
    println!("  truncated blocks: {}", report.truncated_blocks);
    println!("  quality:          {:?}", report.quality);
    Ok(())
}

fn run_info(archive: &std::path::Path) -> Result<(), AcquireError> {
    use forenscan::acquire::metadata::*;
    use forenscan::acquire::sink::Sink;
    use forenscan::acquire::sixcy_sink::SixcySink;
    use std::fs::OpenOptions;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(archive)
        .map_err(forenscan::error::SinkError::from)?;
    let sink = SixcySink::open_existing(file).map_err(forenscan::error::SinkError::from)?;
    let (sector_size, page_size, max_size, declared_size) = sink.prime_geometry();

    println!("── forenscan archive ────────────────────────────────────");
    println!("  path              {}", archive.display());
    println!("  sector size       {sector_size} B");
    println!("  page size         {page_size} B");
    println!("  max size          {}", if max_size == 0 { "unbounded".to_string() } else { max_size.to_string() });
    println!("  declared size     {declared_size} B");

    let text_seg = |name: &str| sink.get_seg(name).map(|v| String::from_utf8_lossy(&v).into_owned());
    let u64_seg = |name: &str| {
        sink.get_seg(name).and_then(|v| v.get(0..8).map(|b| u64::from_le_bytes(b.try_into().unwrap())))
    };

    if let Some(v) = text_seg(SEG_COMMAND_LINE) {
        println!("  command line      {v}");
    }
    if let Some(v) = text_seg(SEG_DEVICE) {
        println!("  device            {v}");
    }
    if let Some(v) = text_seg(SEG_DEVICE_MODEL) {
        println!("  model             {v}");
    }
    if let Some(v) = text_seg(SEG_DEVICE_SERIAL) {
        println!("  serial            {v}");
    }
    if let Some(v) = u64_seg(SEG_BAD_SECTORS) {
        println!("  bad sectors       {v}");
    }
    if let Some(v) = u64_seg(SEG_BLANK_SECTORS) {
        println!("  blank sectors     {v}");
    }
    if let Some(v) = text_seg(SEG_MD5) {
        println!("  md5               {v}");
    }
    if let Some(v) = text_seg(SEG_SHA1) {
        println!("  sha1              {v}");
    }
    if let Some(v) = text_seg(SEG_SHA256) {
        println!("  sha256            {v}");
    }
    if text_seg(SEG_MD5).is_none() {
        println!("  digests           THIS DRIVE COULD NOT BE IMAGED");
    }
    if let Some(v) = text_seg(SEG_CASE_NUMBER) {
        println!("  case number       {v}");
    }
    if let Some(v) = text_seg(SEG_TECHNICIAN) {
        println!("  technician        {v}");
    }

    Ok(())
}

/// Parse a `--max-size` value: a plain byte count, or one of the unit
/// suffixes spec.md §6.3 names (`k`, `m`, `g`, `cd`, `bigcd`, `dvd`,
/// `dvddl`), matching common CD/DVD media capacities.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_lowercase();
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let (num_part, unit) = s.split_at(s.find(|c: char| c.is_alphabetic())?);
    match unit {
        "k" => num_part.parse::<u64>().ok().map(|n| n * 1_000),
        "m" => num_part.parse::<u64>().ok().map(|n| n * 1_000_000),
        "g" => num_part.parse::<u64>().ok().map(|n| n * 1_000_000_000),
        "cd" => Some(700 * 1_000_000),
        "bigcd" => Some(800 * 1_000_000),
        "dvd" => Some(4_700_000_000),
        "dvddl" => Some(8_500_000_000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes_and_suffixes() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("4k"), Some(4_000));
        assert_eq!(parse_size("2m"), Some(2_000_000));
        assert_eq!(parse_size("1g"), Some(1_000_000_000));
        assert_eq!(parse_size("cd"), Some(700_000_000));
        assert_eq!(parse_size("dvddl"), Some(8_500_000_000));
        assert_eq!(parse_size("bogus"), None);
    }
}
