//! `tracing` initialization for the CLI front end.
//!
//! The read loop's state transitions (forward scan, retry, region
//! give-up, reverse flip) are naturally structured events; `tracing`'s
//! `EnvFilter` lets a technician turn on `RUST_LOG=forenscan=debug`
//! without recompiling, the same ergonomics `env_logger` gives the
//! sibling example repos that use plain `log`.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once, at the top of `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
