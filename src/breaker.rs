//! Per-endpoint circuit breaker: closed / open / half-open, lock-free.
//!
//! The half-open state admits exactly one probe. A permit must be reported
//! exactly once; consuming [`BreakerPermit::record`] enforces that, and a
//! permit dropped unreported (a cancelled attempt) releases the probe slot
//! without counting as a result.

use crate::clock::Clock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            CLOSED => Self::Closed,
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => unreachable!("invalid breaker state {raw}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in the closed state that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug)]
struct BreakerShared {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
}

/// Denial detail returned when the breaker is failing fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerDenied {
    pub consecutive_failures: u32,
    pub open_for: Duration,
}

/// Lock-free per-endpoint failure gate.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(CLOSED),
                consecutive_failures: AtomicU32::new(0),
                opened_at_millis: AtomicU64::new(0),
                probe_in_flight: AtomicBool::new(false),
            }),
            config,
            clock,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Acquire)
    }

    /// Ask to perform one attempt.
    ///
    /// `Ok(permit)` obliges the caller to call [`BreakerPermit::record`]
    /// exactly once with the attempt's result, unless the attempt is
    /// abandoned, in which case dropping the permit is the correct cleanup.
    pub fn try_allow(&self) -> Result<BreakerPermit, BreakerDenied> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                CLOSED => return Ok(self.permit(false)),
                OPEN => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.reset_timeout.as_millis() as u64 {
                        return Err(BreakerDenied {
                            consecutive_failures: self.consecutive_failures(),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    match self.shared.state.compare_exchange(
                        OPEN,
                        HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the transition and carry the probe.
                            self.shared.probe_in_flight.store(true, Ordering::Release);
                            tracing::info!("circuit breaker half-open, probing");
                            return Ok(self.permit(true));
                        }
                        Err(_) => continue,
                    }
                }
                HALF_OPEN => {
                    if self
                        .shared
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(self.permit(true));
                    }
                    // Probe already in flight; fail fast.
                    return Err(BreakerDenied {
                        consecutive_failures: self.consecutive_failures(),
                        open_for: Duration::ZERO,
                    });
                }
                raw => unreachable!("invalid breaker state {raw}"),
            }
        }
    }

    fn permit(&self, probe: bool) -> BreakerPermit {
        BreakerPermit {
            shared: self.shared.clone(),
            failure_threshold: self.config.failure_threshold,
            clock: self.clock.clone(),
            probe,
            reported: false,
        }
    }
}

/// Obligation to report one attempt's result back to the breaker.
#[must_use = "the permit must be recorded (or dropped to abandon the attempt)"]
#[derive(Debug)]
pub struct BreakerPermit {
    shared: Arc<BreakerShared>,
    failure_threshold: u32,
    clock: Arc<dyn Clock>,
    probe: bool,
    reported: bool,
}

impl BreakerPermit {
    /// Whether this permit carries the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Report the attempt's result. Returns the new state when this report
    /// caused a transition.
    pub fn record(mut self, success: bool) -> Option<BreakerState> {
        self.reported = true;
        let transition = if success { self.on_success() } else { self.on_failure() };
        if self.probe {
            self.shared.probe_in_flight.store(false, Ordering::Release);
        }
        transition
    }

    fn on_success(&self) -> Option<BreakerState> {
        if self.probe {
            if self
                .shared
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.shared.consecutive_failures.store(0, Ordering::Release);
                self.shared.opened_at_millis.store(0, Ordering::Release);
                tracing::info!("circuit breaker closed");
                return Some(BreakerState::Closed);
            }
            return None;
        }
        if self.shared.state.load(Ordering::Acquire) == CLOSED {
            self.shared.consecutive_failures.store(0, Ordering::Release);
        }
        None
    }

    fn on_failure(&self) -> Option<BreakerState> {
        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if self.probe {
            if self
                .shared
                .state
                .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                tracing::warn!(failures, "circuit breaker probe failed, reopening");
                return Some(BreakerState::Open);
            }
            return None;
        }
        if failures >= self.failure_threshold
            && self
                .shared
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            tracing::error!(failures, threshold = self.failure_threshold, "circuit breaker open");
            return Some(BreakerState::Open);
        }
        None
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        // An abandoned probe releases its slot so a later caller may probe.
        if !self.reported && self.probe {
            self.shared.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn breaker(threshold: u32, reset_millis: u64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_millis),
            },
            Arc::new(clock.clone()),
        );
        (breaker, clock)
    }

    fn fail(breaker: &CircuitBreaker) -> Option<BreakerState> {
        breaker.try_allow().expect("allowed").record(false)
    }

    fn succeed(breaker: &CircuitBreaker) -> Option<BreakerState> {
        breaker.try_allow().expect("allowed").record(true)
    }

    #[test]
    fn starts_closed_and_allows() {
        let (breaker, _clock) = breaker(3, 1000);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(succeed(&breaker), None);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (breaker, _clock) = breaker(3, 1000);
        assert_eq!(fail(&breaker), None);
        assert_eq!(fail(&breaker), None);
        assert_eq!(fail(&breaker), Some(BreakerState::Open));
        assert_eq!(breaker.state(), BreakerState::Open);

        let denied = breaker.try_allow().expect_err("must deny while open");
        assert_eq!(denied.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let (breaker, _clock) = breaker(3, 1000);
        let _ = fail(&breaker);
        let _ = fail(&breaker);
        let _ = succeed(&breaker);
        // Two more failures stay below the threshold after the reset.
        assert_eq!(fail(&breaker), None);
        assert_eq!(fail(&breaker), None);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_timeout_then_closes_on_probe_success() {
        let (breaker, clock) = breaker(1, 500);
        let _ = fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_allow().is_err());

        clock.advance(500);
        let permit = breaker.try_allow().expect("probe allowed");
        assert!(permit.is_probe());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(permit.record(true), Some(BreakerState::Closed));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn probe_failure_reopens() {
        let (breaker, clock) = breaker(1, 500);
        let _ = fail(&breaker);
        clock.advance(500);
        let permit = breaker.try_allow().expect("probe allowed");
        assert_eq!(permit.record(false), Some(BreakerState::Open));
        assert_eq!(breaker.state(), BreakerState::Open);
        // Freshly reopened: denied until another reset interval elapses.
        assert!(breaker.try_allow().is_err());
        clock.advance(500);
        assert!(breaker.try_allow().is_ok());
    }

    #[test]
    fn only_one_concurrent_probe() {
        let (breaker, clock) = breaker(1, 500);
        let _ = fail(&breaker);
        clock.advance(500);
        let probe = breaker.try_allow().expect("first probe");
        assert!(probe.is_probe());
        let denied = breaker.try_allow().expect_err("second probe denied");
        assert_eq!(denied.open_for, Duration::ZERO);
        drop(probe); // abandoned probe releases the slot
        assert!(breaker.try_allow().is_ok());
    }

    #[test]
    fn abandoned_closed_permit_changes_nothing() {
        let (breaker, _clock) = breaker(2, 500);
        let permit = breaker.try_allow().expect("allowed");
        drop(permit);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn transitions_stay_legal_under_adversarial_sequences() {
        let mut rng = StdRng::seed_from_u64(0xfeed);
        let (breaker, clock) = breaker(3, 200);
        let mut previous = breaker.state();
        for _ in 0..2000 {
            if rng.random_range(0..4) == 0 {
                clock.advance(rng.random_range(0..400));
            }
            if let Ok(permit) = breaker.try_allow() {
                // try_allow may itself step open -> half-open; observe that
                // before recording so the adjacency check below stays exact.
                previous = breaker.state();
                let was_probe = permit.is_probe();
                if let Some(next) = permit.record(rng.random_bool(0.5)) {
                    // closed is only ever entered from a half-open probe
                    if next == BreakerState::Closed {
                        assert!(was_probe);
                    }
                }
            }
            let state = breaker.state();
            assert!(
                !(previous == BreakerState::Open && state == BreakerState::Closed),
                "open must pass through half-open before closing"
            );
            previous = state;
        }
    }
}
