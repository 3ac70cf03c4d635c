//! Per-endpoint send spacing.
//!
//! Single-slot logic: one send per `min_interval`, no burst allowance. The
//! limiter is a property of the endpoint key, not of any item. Waiters are
//! serialized FIFO by a fair async mutex held across the interval wait (the
//! wait is the serialization the contract asks for; the mutex is never held
//! across the HTTP call itself).

use crate::clock::Clock;
use crate::sleeper::Sleeper;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Acquire was cancelled; limiter state is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireCancelled;

impl fmt::Display for AcquireCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rate limiter acquire cancelled")
    }
}

impl std::error::Error for AcquireCancelled {}

/// Minimum-interval gate for one endpoint.
#[derive(Debug)]
pub struct MinIntervalLimiter {
    /// Millis on the pipeline clock of the last granted slot.
    last_send: tokio::sync::Mutex<Option<u64>>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl MinIntervalLimiter {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { last_send: tokio::sync::Mutex::new(None), interval, clock, sleeper }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the endpoint's interval has elapsed, then take the slot.
    ///
    /// Returns how long the caller waited. Cancellation aborts the wait and
    /// leaves `last_send` unmodified, so a cancelled acquire never costs the
    /// endpoint a slot.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Duration, AcquireCancelled> {
        if cancel.is_cancelled() {
            return Err(AcquireCancelled);
        }
        let mut last = tokio::select! {
            guard = self.last_send.lock() => guard,
            _ = cancel.cancelled() => return Err(AcquireCancelled),
        };
        let interval_millis = self.interval.as_millis() as u64;
        let mut waited = Duration::ZERO;
        match *last {
            None => {
                *last = Some(self.clock.now_millis());
            }
            Some(prev) => {
                let ready_at = prev.saturating_add(interval_millis);
                let now = self.clock.now_millis();
                if now < ready_at {
                    let wait = Duration::from_millis(ready_at - now);
                    tokio::select! {
                        _ = self.sleeper.sleep(wait) => waited = wait,
                        _ = cancel.cancelled() => return Err(AcquireCancelled),
                    }
                }
                // Advance the schedule even under a coarse clock so two
                // grants are never closer than the interval.
                *last = Some(self.clock.now_millis().max(ready_at));
            }
        }
        Ok(waited)
    }
}
