//! Per-probe verdicts. Both classifiers are pure; styling is decided
//! elsewhere.

use std::{fmt, time::Duration};

use common::RunningStatistics;

/// Where a probe's RTT sits relative to the running mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttVerdict {
    /// Faster than the mean by more than one standard deviation
    Low,
    Normal,
    /// Slower than the mean by more than one standard deviation
    High,
}

impl RttVerdict {
    /// A deviation exactly equal to the standard deviation is `Normal`.
    ///
    /// On the first reply the snapshot holds only that reply, so the
    /// deviation and the standard deviation are both zero and the verdict is
    /// `Normal`. A snapshot that does not yet include the reply has a zero
    /// mean, which makes any non-zero RTT `High`.
    pub fn classify(stats: &RunningStatistics, rtt: Duration) -> Self {
        let diff = stats.avg_rtt.as_nanos() as i128 - rtt.as_nanos() as i128;
        if diff.unsigned_abs() <= stats.stddev_rtt.as_nanos() {
            RttVerdict::Normal
        } else if diff >= 0 {
            RttVerdict::Low
        } else {
            RttVerdict::High
        }
    }
}

impl fmt::Display for RttVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RttVerdict::Low => "low",
            RttVerdict::Normal => "normal",
            RttVerdict::High => "high",
        })
    }
}

/// How late a reply is compared to the probe interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapVerdict {
    Normal,
    /// At least two intervals since the last reply
    Delayed,
    /// At least three intervals since the last reply
    SeverelyDelayed,
}

impl GapVerdict {
    /// `gap` is zero when there was no earlier reply, which is always
    /// `Normal`.
    pub fn classify(interval: Duration, gap: Duration) -> Self {
        if gap.is_zero() {
            GapVerdict::Normal
        } else if gap >= interval.saturating_mul(3) {
            GapVerdict::SeverelyDelayed
        } else if gap >= interval.saturating_mul(2) {
            GapVerdict::Delayed
        } else {
            GapVerdict::Normal
        }
    }
}

impl fmt::Display for GapVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GapVerdict::Normal => "normal",
            GapVerdict::Delayed => "delayed",
            GapVerdict::SeverelyDelayed => "severe",
        })
    }
}
