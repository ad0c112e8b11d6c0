use std::time::Duration;

use chatdrop_protocol::Milestone;

/// Number of cells in the text progress bar.
pub const PROGRESS_BAR_WIDTH: usize = 20;

/// Percent thresholds that produce a milestone when first crossed.
const PERCENT_STEP: u8 = 10;

/// Point-in-time progress of one session.
///
/// Recomputed from scratch on every chunk arrival; nothing here keeps a
/// timer or remembers earlier samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub received_bytes: u64,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub declared_total: u64,
    /// `received_bytes / declared_total`, in `0.0..=1.0`.
    pub byte_progress: f64,
    /// `received_chunks / total_chunks`, in `0.0..=1.0`.
    pub chunk_progress: f64,
    /// Bytes per second since the first chunk.
    pub rate: f64,
    /// Time left at the current rate; `None` while the rate is zero or the
    /// estimate does not fit a `Duration`.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn compute(
        received_bytes: u64,
        received_chunks: u32,
        total_chunks: u32,
        declared_total: u64,
        elapsed: Duration,
    ) -> Self {
        let chunk_progress = ratio(received_chunks as f64, total_chunks as f64);
        // A zero-byte file has no byte progress to speak of; fall back to
        // counting chunks.
        let byte_progress = if declared_total == 0 {
            chunk_progress
        } else {
            ratio(received_bytes as f64, declared_total as f64)
        };

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            received_bytes as f64 / secs
        } else {
            0.0
        };
        // Unrepresentable ETAs (a crawl through a huge file) read as unknown.
        let eta = if rate > 0.0 {
            let remaining = declared_total.saturating_sub(received_bytes) as f64;
            Duration::try_from_secs_f64(remaining / rate).ok()
        } else {
            None
        };

        Self {
            received_bytes,
            received_chunks,
            total_chunks,
            declared_total,
            byte_progress,
            chunk_progress,
            rate,
            eta,
        }
    }

    /// Byte progress as a percentage.
    pub fn percent(&self) -> f64 {
        self.byte_progress * 100.0
    }

    /// Renders a bar such as `[########------------]`.
    pub fn bar(&self, width: usize) -> String {
        let filled = ((self.byte_progress * width as f64).floor() as usize).min(width);
        let mut out = String::with_capacity(width + 2);
        out.push('[');
        out.extend(std::iter::repeat_n('#', filled));
        out.extend(std::iter::repeat_n('-', width - filled));
        out.push(']');
        out
    }

    /// Whether at least `percent` percent has been received.
    ///
    /// Integer arithmetic keeps threshold decisions exact.
    fn reached(&self, percent: u8) -> bool {
        let (done, total) = if self.declared_total == 0 {
            (self.received_chunks as u128, self.total_chunks as u128)
        } else {
            (self.received_bytes as u128, self.declared_total as u128)
        };
        total > 0 && done * 100 >= percent as u128 * total
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den <= 0.0 {
        return 0.0;
    }
    (num / den).clamp(0.0, 1.0)
}

/// Remembers which milestones a session has already reported.
///
/// Each milestone is returned by [`observe`](Self::observe) at most once,
/// so retransmitted chunks or a later dip in `received_bytes` never repeat
/// one.
#[derive(Debug, Default, Clone)]
pub struct MilestoneTracker {
    first: bool,
    last: bool,
    /// Bit `n` set once `(n + 1) * 10` percent was reported.
    percents: u16,
}

impl MilestoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the milestones newly reached by `snapshot`, in the order
    /// first chunk, ascending percentages, last chunk.
    pub fn observe(&mut self, snapshot: &ProgressSnapshot) -> Vec<Milestone> {
        let mut out = Vec::new();

        if !self.first && snapshot.received_chunks > 0 {
            self.first = true;
            out.push(Milestone::FirstChunk);
        }

        for step in 1..=(100 / PERCENT_STEP) {
            let bit = 1u16 << (step - 1);
            if self.percents & bit != 0 {
                continue;
            }
            let percent = step * PERCENT_STEP;
            if snapshot.reached(percent) {
                self.percents |= bit;
                out.push(Milestone::Percent { percent });
            }
        }

        if !self.last && snapshot.total_chunks > 0 && snapshot.received_chunks == snapshot.total_chunks {
            self.last = true;
            out.push(Milestone::LastChunk);
        }

        out
    }
}
