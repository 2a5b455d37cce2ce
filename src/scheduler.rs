//! Priority Scheduler (C3): a four-level priority gate every outgoing REST
//! call passes through, plus the global 250ms inter-call rate limit.
//!
//! Grounded in the teacher's `binance/rate_limit.rs` atomic-counter style,
//! simplified from Binance's weight-header bookkeeping down to the interval
//! gate and in-flight counter spec §4.1/§5 actually call for.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// §4.1 priority levels. Ord so `CRITICAL < HIGH < NORMAL < LOW` sorts by
/// urgency, matching the numbering in spec.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

const MIN_CALL_INTERVAL: Duration = Duration::from_millis(250);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    last_api_call_at: Option<Instant>,
}

/// Shared gate all Gateway calls are dispatched through.
pub struct Scheduler {
    inner: Mutex<Inner>,
    critical_in_flight: AtomicU32,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard decrementing `critical_in_flight` when a CRITICAL call
/// completes (on either success or error — drop always runs).
pub struct CriticalGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.critical_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { last_api_call_at: None }),
            critical_in_flight: AtomicU32::new(0),
        }
    }

    pub fn critical_in_flight(&self) -> u32 {
        self.critical_in_flight.load(Ordering::SeqCst)
    }

    /// Blocks (busy-waiting with a 10ms poll, per §4.1) until this call may
    /// proceed, then enforces the global 250ms inter-call spacing. Returns
    /// a guard that must be held for the duration of a CRITICAL call.
    pub fn acquire(&self, priority: Priority) -> Option<CriticalGuard<'_>> {
        if priority == Priority::Critical {
            self.critical_in_flight.fetch_add(1, Ordering::SeqCst);
            self.wait_for_rate_limit();
            return Some(CriticalGuard { scheduler: self });
        }

        let started = Instant::now();
        while self.critical_in_flight.load(Ordering::SeqCst) > 0 {
            if started.elapsed() >= WAIT_TIMEOUT {
                warn!(?priority, "priority wait exceeded 5s, proceeding anyway");
                break;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }

        self.wait_for_rate_limit();
        None
    }

    fn wait_for_rate_limit(&self) {
        loop {
            let wait = {
                let mut guard = self.inner.lock();
                match guard.last_api_call_at {
                    Some(last) if last.elapsed() < MIN_CALL_INTERVAL => {
                        Some(MIN_CALL_INTERVAL - last.elapsed())
                    }
                    _ => {
                        guard.last_api_call_at = Some(Instant::now());
                        None
                    }
                }
            };
            match wait {
                Some(d) => std::thread::sleep(d),
                None => break,
            }
        }
        debug!("scheduler: rate gate cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn critical_never_waits_on_other_critical_count() {
        let sched = Arc::new(Scheduler::new());
        let _g1 = sched.acquire(Priority::Critical);
        assert_eq!(sched.critical_in_flight(), 1);
        let _g2 = sched.acquire(Priority::Critical);
        assert_eq!(sched.critical_in_flight(), 2);
    }

    #[test]
    fn guard_drop_decrements_in_flight() {
        let sched = Scheduler::new();
        {
            let _g = sched.acquire(Priority::Critical);
            assert_eq!(sched.critical_in_flight(), 1);
        }
        assert_eq!(sched.critical_in_flight(), 0);
    }

    #[test]
    fn high_priority_waits_while_critical_in_flight_then_times_out_and_proceeds() {
        let sched = Arc::new(Scheduler::new());
        let s2 = sched.clone();
        let _g = sched.acquire(Priority::Critical);
        let handle = std::thread::spawn(move || {
            // With the critical guard held for the whole test this would
            // normally wait forever; exercised indirectly via timing in
            // integration-level tests. Here we only assert it does not
            // panic and returns None (non-critical).
            s2.acquire(Priority::Normal)
        });
        drop(_g);
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn ordinal_ordering_matches_urgency() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }
}
