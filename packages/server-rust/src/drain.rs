//! Drain control with in-flight work tracking.
//!
//! A [`DrainController`] gates admission of new work and counts admitted work
//! through RAII guards. Once draining starts no new guard is issued, and
//! [`DrainController::wait_for_drain`] resolves as soon as the last guard
//! drops. The count lives in a `watch` channel so waiters are woken on each
//! release rather than polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Outcome of waiting for in-flight work to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight work completed within the timeout.
    Drained,
    /// The timeout elapsed with work still in flight.
    TimedOut {
        /// Work still in flight when the timeout elapsed.
        remaining: u64,
    },
}

impl DrainOutcome {
    #[must_use]
    pub fn is_drained(self) -> bool {
        matches!(self, DrainOutcome::Drained)
    }
}

/// Admission gate plus in-flight counter.
///
/// Admission increments the counter before checking the draining flag, so a
/// caller racing with [`begin_drain`](DrainController::begin_drain) is either
/// counted (and waited for) or turned away; never both missed and admitted.
#[derive(Debug)]
pub struct DrainController {
    draining: AtomicBool,
    in_flight: Arc<watch::Sender<u64>>,
}

impl DrainController {
    /// Creates a controller that admits work.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            draining: AtomicBool::new(false),
            in_flight: Arc::new(tx),
        }
    }

    /// Admits one unit of work, or returns `None` once draining has begun.
    #[must_use]
    pub fn try_enter(&self) -> Option<InFlightGuard> {
        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        if self.draining.load(Ordering::SeqCst) {
            drop(guard);
            return None;
        }
        Some(guard)
    }

    /// Stops admitting new work. Idempotent.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`begin_drain`](Self::begin_drain) has been called.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Current number of admitted, unfinished units of work.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.in_flight.borrow()
    }

    /// Waits until no work is in flight, up to `timeout`.
    ///
    /// Does not itself stop admission; call [`begin_drain`](Self::begin_drain)
    /// first if the count must converge.
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainOutcome {
        let mut rx = self.in_flight.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if drained {
            DrainOutcome::Drained
        } else {
            DrainOutcome::TimedOut {
                remaining: self.in_flight_count(),
            }
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that releases its unit of in-flight work when dropped.
///
/// Release happens during unwinding too, so a panicking task never leaves
/// the counter stuck.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<u64>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
