//! Incremental whole-image digests.
//!
//! Mirrors `imager::write_data()`'s running MD5/SHA-1/SHA-256: each digest
//! is fed every byte written to the sink, in source order, and is latched
//! invalid the moment a gap, skip, or out-of-order write breaks that
//! contiguity — a digest computed over a reordered or incomplete stream is
//! worse than no digest, so it is reported as unavailable rather than wrong.
//!
//! `RunningHash` can also run the digests on an auxiliary thread
//! (`new_threaded`) per spec.md §5's hash-concurrency note: the read loop
//! hands each captured buffer off through a bounded, single-slot channel
//! and keeps reading while the worker catches up. `update`/`invalidate`
//! never block past that one slot; only `is_valid`/`finish` wait for the
//! worker to drain.

use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread::JoinHandle;

use md5::Md5;
use sha1::Digest as _;
use sha1::Sha1;
use sha2::Sha256;

/// Final digest values, hex-encoded for the archive's metadata segment.
#[derive(Debug, Clone, Default)]
pub struct HashDigests {
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

/// The actual digest state, whichever thread happens to own it.
struct Digesters {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    next_offset: u64,
    valid: bool,
}

impl Digesters {
    fn new(start_offset: u64) -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            next_offset: start_offset,
            valid: true,
        }
    }

    fn update(&mut self, offset: u64, data: &[u8]) {
        if offset != self.next_offset {
            self.valid = false;
        }
        if self.valid {
            self.md5.update(data);
            self.sha1.update(data);
            self.sha256.update(data);
        }
        self.next_offset = offset + data.len() as u64;
    }

    fn invalidate(&mut self) {
        self.valid = false;
    }

    fn finish(self) -> HashDigests {
        if !self.valid {
            return HashDigests::default();
        }
        HashDigests {
            md5: Some(hex::encode(self.md5.finalize())),
            sha1: Some(hex::encode(self.sha1.finalize())),
            sha256: Some(hex::encode(self.sha256.finalize())),
        }
    }
}

enum WorkerMsg {
    Update(u64, Vec<u8>),
    Invalidate,
}

enum Mode {
    Disabled,
    Direct(Digesters),
    /// Bounded (capacity one) hand-off to the worker thread named by `join`.
    Threaded {
        tx: SyncSender<WorkerMsg>,
        join: JoinHandle<Digesters>,
    },
}

/// Incremental hasher over the logical (uncompressed) byte stream written
/// to the sink. `next_offset` tracks the next expected contiguous byte
/// offset; any `update` call at a different offset invalidates the running
/// digests for the remainder of the run.
pub struct RunningHash {
    mode: Mode,
}

impl RunningHash {
    pub fn new(start_offset: u64, enabled: bool) -> Self {
        let mode = if enabled { Mode::Direct(Digesters::new(start_offset)) } else { Mode::Disabled };
        Self { mode }
    }

    /// Spawn the digests onto an auxiliary thread. `update` sends each
    /// buffer across a single-slot channel instead of hashing inline, so
    /// the read loop can start filling the next buffer as soon as the
    /// worker picks this one up rather than waiting for the hash to
    /// finish. `is_valid`/`finish` join the worker, so they block until
    /// every queued buffer has actually been hashed.
    pub fn new_threaded(start_offset: u64) -> Self {
        let (tx, rx) = sync_channel::<WorkerMsg>(1);
        let join = std::thread::Builder::new()
            .name("forenscan-hash".into())
            .spawn(move || {
                let mut state = Digesters::new(start_offset);
                while let Ok(msg) = rx.recv() {
                    match msg {
                        WorkerMsg::Update(offset, data) => state.update(offset, &data),
                        WorkerMsg::Invalidate => state.invalidate(),
                    }
                }
                state
            })
            .expect("failed to spawn hash worker thread");
        Self { mode: Mode::Threaded { tx, join } }
    }

    /// Feed `data`, logically located at `offset` in the source stream.
    /// A non-contiguous `offset` (a skipped region, a reverse-direction
    /// write landing out of order) latches the digests invalid; later
    /// contiguous writes do not un-latch them.
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        match &self.mode {
            Mode::Disabled => {}
            Mode::Direct(_) => {
                if let Mode::Direct(d) = &mut self.mode {
                    d.update(offset, data);
                }
            }
            Mode::Threaded { tx, .. } => {
                let _ = tx.send(WorkerMsg::Update(offset, data.to_vec()));
            }
        }
    }

    /// Explicitly latch the digests invalid, e.g. when the loop gives up
    /// on a region and the gap will be filled with zero-padding later
    /// rather than replayed in order.
    pub fn invalidate(&mut self) {
        match &mut self.mode {
            Mode::Disabled => {}
            Mode::Direct(d) => d.invalidate(),
            Mode::Threaded { tx, .. } => {
                let _ = tx.send(WorkerMsg::Invalidate);
            }
        }
    }

    /// Closes the hand-off channel and joins the worker thread, if one is
    /// running, folding its final state back into `Mode::Direct` so
    /// `is_valid`/`finish` never join twice.
    fn settle(&mut self) {
        if let Mode::Threaded { tx, join } = std::mem::replace(&mut self.mode, Mode::Disabled) {
            drop(tx);
            let state = join.join().expect("hash worker thread panicked");
            self.mode = Mode::Direct(state);
        }
    }

    pub fn is_valid(&mut self) -> bool {
        self.settle();
        match &self.mode {
            Mode::Disabled => false,
            Mode::Direct(d) => d.valid,
            Mode::Threaded { .. } => unreachable!("settle() always clears Threaded"),
        }
    }

    /// Finalize. Returns `None` fields throughout if hashing was disabled
    /// or was invalidated somewhere in the run.
    pub fn finish(mut self) -> HashDigests {
        self.settle();
        match self.mode {
            Mode::Disabled => HashDigests::default(),
            Mode::Direct(d) => d.finish(),
            Mode::Threaded { .. } => unreachable!("settle() always clears Threaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_writes_produce_digests() {
        let mut h = RunningHash::new(0, true);
        h.update(0, b"hello ");
        h.update(6, b"world");
        let digests = h.finish();
        assert!(digests.md5.is_some());
        assert!(digests.sha1.is_some());
        assert!(digests.sha256.is_some());
    }

    #[test]
    fn gap_invalidates_digests() {
        let mut h = RunningHash::new(0, true);
        h.update(0, b"hello ");
        h.update(100, b"world"); // non-contiguous: a skipped region
        let digests = h.finish();
        assert!(digests.md5.is_none());
        assert!(digests.sha1.is_none());
        assert!(digests.sha256.is_none());
    }

    #[test]
    fn disabled_hashing_produces_nothing() {
        let mut h = RunningHash::new(0, false);
        h.update(0, b"hello");
        let digests = h.finish();
        assert!(digests.md5.is_none());
    }

    #[test]
    fn threaded_mode_matches_direct_mode() {
        let mut direct = RunningHash::new(0, true);
        direct.update(0, b"hello ");
        direct.update(6, b"world");
        let direct_digests = direct.finish();

        let mut threaded = RunningHash::new_threaded(0);
        threaded.update(0, b"hello ");
        threaded.update(6, b"world");
        let threaded_digests = threaded.finish();

        assert_eq!(direct_digests.md5, threaded_digests.md5);
        assert_eq!(direct_digests.sha1, threaded_digests.sha1);
        assert_eq!(direct_digests.sha256, threaded_digests.sha256);
    }

    #[test]
    fn threaded_mode_latches_invalid_on_gap() {
        let mut h = RunningHash::new_threaded(0);
        h.update(0, b"hello ");
        h.update(100, b"world");
        assert!(!h.is_valid());
    }
}
