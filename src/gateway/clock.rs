//! Hourly exchange clock-drift check (§4.2 order preamble step 1).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

const DRIFT_TOLERANCE_MS: i64 = 5_000;
const RECHECK_INTERVAL_SECS: i64 = 3_600;

struct State {
    last_check: Option<DateTime<Utc>>,
    drift_ms: i64,
}

/// Tracks drift between local clock and exchange server time, re-checked
/// at most once an hour.
pub struct ClockSync {
    state: Mutex<State>,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { last_check: None, drift_ms: 0 }),
        }
    }

    pub fn needs_recheck(&self) -> bool {
        let state = self.state.lock();
        match state.last_check {
            None => true,
            Some(last) => (Utc::now() - last).num_seconds() >= RECHECK_INTERVAL_SECS,
        }
    }

    /// Records a freshly-observed server time and returns the resulting
    /// drift in milliseconds.
    pub fn record_server_time(&self, server_time: DateTime<Utc>) -> i64 {
        let drift_ms = (Utc::now() - server_time).num_milliseconds();
        let mut state = self.state.lock();
        state.last_check = Some(Utc::now());
        state.drift_ms = drift_ms;
        drift_ms
    }

    pub fn drift_ms(&self) -> i64 {
        self.state.lock().drift_ms
    }

    /// §7: drift beyond tolerance halts new-order submission at the
    /// Gateway; existing-position closes are still attempted by callers.
    pub fn is_within_tolerance(&self) -> bool {
        self.state.lock().drift_ms.abs() <= DRIFT_TOLERANCE_MS
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clock_needs_recheck() {
        let c = ClockSync::new();
        assert!(c.needs_recheck());
    }

    #[test]
    fn small_drift_is_within_tolerance() {
        let c = ClockSync::new();
        c.record_server_time(Utc::now() - chrono::Duration::milliseconds(100));
        assert!(c.is_within_tolerance());
    }

    #[test]
    fn large_drift_exceeds_tolerance() {
        let c = ClockSync::new();
        c.record_server_time(Utc::now() - chrono::Duration::milliseconds(10_000));
        assert!(!c.is_within_tolerance());
    }
}
