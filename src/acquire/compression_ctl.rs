//! Compression Controller (E) — spec.md §4.5.
//!
//! A one-shot A/B experiment, not a continuously adapting policy: the
//! first segment is timed with compression on, the second with
//! compression off, and whichever finished its write phase faster is
//! locked in for every remaining segment. The decision is never revisited.

use std::time::{Duration, Instant};

use super::sink::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Undecided,
    CompressionWins,
    NoCompressionWins,
}

/// Drives the A/B measurement described above. `page_index` in
/// `on_phase` is treated as the segment counter: segment 0 forces
/// compression on, segment 1 forces it off, and from segment 2 onward
/// the decision is fixed.
pub struct CompressionController {
    decision: Decision,
    compress_start: Option<Instant>,
    write_start: Option<Instant>,
    ac_compress_write_time: Option<Duration>,
    ac_nocompress_write_time: Option<Duration>,
}

impl CompressionController {
    pub fn new() -> Self {
        Self {
            decision: Decision::Undecided,
            compress_start: None,
            write_start: None,
            ac_compress_write_time: None,
            ac_nocompress_write_time: None,
        }
    }

    /// Whether compression should be applied to the segment currently
    /// about to be written.
    pub fn compress_this_segment(&self, segment_index: u64) -> bool {
        match self.decision {
            Decision::Undecided => segment_index == 0,
            Decision::CompressionWins => true,
            Decision::NoCompressionWins => false,
        }
    }

    pub fn on_phase(&mut self, segment_index: u64, phase: Phase) {
        match phase {
            Phase::CompressionStart => {
                self.compress_start = Some(Instant::now());
            }
            Phase::WriteStart => {
                self.write_start = Some(Instant::now());
            }
            Phase::WriteEnd => {
                let elapsed = self.write_start.take().map(|t| t.elapsed());
                self.compress_start = None;
                if self.decision != Decision::Undecided {
                    return;
                }
                match (segment_index, elapsed) {
                    (0, Some(d)) => self.ac_compress_write_time = Some(d),
                    (1, Some(d)) => {
                        self.ac_nocompress_write_time = Some(d);
                        if let (Some(c), Some(nc)) =
                            (self.ac_compress_write_time, self.ac_nocompress_write_time)
                        {
                            self.decision = if c < nc {
                                Decision::CompressionWins
                            } else {
                                Decision::NoCompressionWins
                            };
                        }
                    }
                    _ => {}
                }
            }
            Phase::CompressionEnd => {}
        }
    }

    pub fn is_decided(&self) -> bool {
        self.decision != Decision::Undecided
    }
}

impl Default for CompressionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_two_segments_force_both_arms() {
        let ctl = CompressionController::new();
        assert!(ctl.compress_this_segment(0));
    }

    #[test]
    fn decision_locks_after_segment_two() {
        let mut ctl = CompressionController::new();
        ctl.on_phase(0, Phase::WriteStart);
        std::thread::sleep(Duration::from_millis(1));
        ctl.on_phase(0, Phase::WriteEnd);
        ctl.on_phase(1, Phase::WriteStart);
        ctl.on_phase(1, Phase::WriteEnd);
        assert!(ctl.is_decided());
        let before = ctl.compress_this_segment(2);
        ctl.on_phase(2, Phase::WriteStart);
        ctl.on_phase(2, Phase::WriteEnd);
        assert_eq!(before, ctl.compress_this_segment(50));
    }
}
