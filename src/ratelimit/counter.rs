//! Persisted counter state and window units.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Named time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// The state stored for one quota key during its active window.
///
/// `remaining` is never written back negative; the limiter clamps it
/// before persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
    /// Requests still permitted in the current window
    pub remaining: i64,
    /// Window start, in unix seconds
    pub created_at: i64,
}

impl CounterEntry {
    /// Create a new counter entry.
    pub fn new(remaining: i64, created_at: i64) -> Self {
        Self {
            remaining,
            created_at,
        }
    }

    /// Seconds left in the window at `now` for a window of `period_secs`.
    ///
    /// Zero or negative means the window has elapsed. Saturates instead of
    /// overflowing on out-of-range stored values.
    pub fn seconds_until_reset(&self, period_secs: i64, now: i64) -> i64 {
        self.created_at
            .saturating_add(period_secs)
            .saturating_sub(now)
    }
}
