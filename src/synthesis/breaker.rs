//! # Circuit Breaker
//!
//! Per-provider failure isolation for remote synthesis calls. Each provider
//! gets its own breaker; consecutive classified failures open it, an open
//! breaker rejects calls without touching the network, and after a cooldown
//! a single trial call probes whether the provider recovered.
//!
//! State transitions:
//! - CLOSED → OPEN after `failure_threshold` consecutive classified failures
//! - OPEN → HALF_OPEN once the cooldown elapses (first caller gets the trial)
//! - HALF_OPEN → CLOSED on trial success, → OPEN on trial failure
//!
//! Only one trial is in flight at a time; concurrent callers during a trial
//! are rejected as if the breaker were still open.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed; call freely.
    Allowed,
    /// Breaker is half-open and this caller holds the single trial slot.
    /// The caller MUST report the outcome via `record_success`,
    /// `record_failure`, or `abandon_trial`.
    Trial,
    /// Breaker is open (or a trial is already in flight); do not call.
    Rejected,
}

/// Point-in-time view of one breaker, for health and metrics reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure isolation for one named provider.
///
/// Generic over the error type; the classifier decides which errors count as
/// provider failures. Errors it rejects (e.g. caller-fault 4xx responses)
/// leave the failure count untouched.
pub struct CircuitBreaker<E> {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    classifier: Box<dyn Fn(&E) -> bool + Send + Sync>,
    inner: Mutex<BreakerInner>,
}

impl<E> CircuitBreaker<E> {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        classifier: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            cooldown,
            classifier: Box::new(classifier),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for permission to make a call.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker from any state.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call.
    ///
    /// Failures the classifier rejects do not count toward opening; in
    /// half-open they end the trial inconclusively so the next caller may
    /// probe again.
    pub fn record_failure(&self, error: &E) {
        let counts = (self.classifier)(error);
        let mut inner = self.inner.lock().unwrap();
        inner.trial_in_flight = false;

        if !counts {
            return;
        }

        match inner.state {
            BreakerState::HalfOpen => {
                // Failed trial: back to open, cooldown restarts.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures += 1;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Give up a trial slot without completing the call (task cancelled,
    /// session closed). Treated like a failed trial: the breaker reopens.
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            provider: self.name.clone(),
            state: inner.state.as_str(),
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker<bool> {
        // Classifier: the error itself says whether it counts.
        CircuitBreaker::new(
            "test",
            threshold,
            Duration::from_millis(cooldown_ms),
            |counts: &bool| *counts,
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 60_000);

        cb.record_failure(&true);
        cb.record_failure(&true);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed);

        cb.record_failure(&true);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 60_000);

        cb.record_failure(&true);
        cb.record_failure(&true);
        cb.record_success();
        cb.record_failure(&true);
        cb.record_failure(&true);

        // Never three in a row, so still closed.
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_unclassified_failures_do_not_open() {
        let cb = breaker(2, 60_000);

        cb.record_failure(&false);
        cb.record_failure(&false);
        cb.record_failure(&false);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1, 10);
        cb.record_failure(&true);
        assert_eq!(cb.try_acquire(), Admission::Rejected);

        sleep(Duration::from_millis(20));

        // First caller after cooldown holds the trial slot.
        assert_eq!(cb.try_acquire(), Admission::Trial);
        // Concurrent caller is rejected while the trial is in flight.
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_trial_success_closes() {
        let cb = breaker(1, 10);
        cb.record_failure(&true);
        sleep(Duration::from_millis(20));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.record_success();

        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn test_trial_failure_reopens_and_cooldown_restarts() {
        let cb = breaker(1, 10);
        cb.record_failure(&true);
        sleep(Duration::from_millis(20));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.record_failure(&true);

        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);

        // A fresh cooldown admits a new trial.
        sleep(Duration::from_millis(20));
        assert_eq!(cb.try_acquire(), Admission::Trial);
    }

    #[test]
    fn test_abandoned_trial_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure(&true);
        sleep(Duration::from_millis(20));

        assert_eq!(cb.try_acquire(), Admission::Trial);
        cb.abandon_trial();

        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn test_snapshot_reports_state() {
        let cb = breaker(1, 60_000);
        let snap = cb.snapshot();
        assert_eq!(snap.state, "closed");
        assert_eq!(snap.consecutive_failures, 0);

        cb.record_failure(&true);
        let snap = cb.snapshot();
        assert_eq!(snap.state, "open");
        assert_eq!(snap.consecutive_failures, 1);
    }
}
