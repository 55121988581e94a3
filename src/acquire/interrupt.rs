//! Process-wide interrupt flag — spec.md §4.8 "Interrupt handling" /
//! §5's "Shared resources."
//!
//! Design Notes §9 asks for the signal handler to read the "current
//! coordinator" from a process-wide single-cell holder rather than a
//! process-global `Coordinator` pointer. In this implementation the
//! holder carries only the two bits of state the read loop actually
//! needs to act on (has a signal arrived, has a second one arrived),
//! not a handle to the coordinator itself — the coordinator is already
//! scoped to one `run()` call and finalizes/closes its sink
//! unconditionally after the read loop returns, so the graceful-close
//! half of "first interrupt closes gracefully" falls out of normal
//! control flow once the loop observes the flag and terminates.

use std::sync::atomic::{AtomicU8, Ordering};

const NONE: u8 = 0;
const REQUESTED: u8 = 1;
const SECOND: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(NONE);

/// True once any interrupt has been observed. Checked by the read loop
/// before every iteration (spec.md §4.6 "Before each read, a status
/// callback is invoked" — the interrupt check sits alongside it).
pub fn requested() -> bool {
    STATE.load(Ordering::SeqCst) != NONE
}

/// Record one interrupt signal. Returns `true` if this was the *second*
/// signal received during shutdown — the caller (the CLI's signal
/// handler) must exit immediately in that case rather than waiting for
/// a graceful close.
pub fn signal() -> bool {
    let prev = STATE.swap(SECOND, Ordering::SeqCst).max(REQUESTED);
    // First call: prev was NONE, we just set SECOND but should report
    // "first signal" (not immediate-exit) and leave state at REQUESTED
    // so a genuinely second signal is still distinguishable.
    if prev == NONE {
        STATE.store(REQUESTED, Ordering::SeqCst);
        false
    } else {
        true
    }
}

/// Reset before a fresh `Coordinator::run()`. Re-entry isn't supported
/// per spec.md §3, but tests construct multiple coordinators in one
/// process and each should start from a clean slate.
pub fn reset() {
    STATE.store(NONE, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The flag is a process-wide static; serialize tests that touch it.
    static LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn first_signal_is_not_immediate_exit() {
        let _g = LOCK.lock().unwrap();
        reset();
        assert!(!requested());
        assert!(!signal());
        assert!(requested());
        reset();
    }

    #[test]
    fn second_signal_requests_immediate_exit() {
        let _g = LOCK.lock().unwrap();
        reset();
        assert!(!signal());
        assert!(signal());
        reset();
    }
}
