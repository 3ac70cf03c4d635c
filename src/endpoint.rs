//! Lazily-created per-endpoint state: rate limiter plus circuit breaker.
//!
//! State is keyed by the canonicalized endpoint key and lives until the
//! endpoint has been idle for the configured TTL; the controller sweeps
//! idle entries on its tick.

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::clock::Clock;
use crate::rate_limit::MinIntervalLimiter;
use crate::sleeper::Sleeper;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stable identifier scoping limiter and breaker state.
///
/// Trims whitespace and trailing slashes so `https://h.test/hook` and
/// `https://h.test/hook/` share one endpoint's budget.
pub fn canonical_key(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

/// Shared per-endpoint state. Mutated only through the sender's limiter and
/// breaker calls.
#[derive(Debug)]
pub struct EndpointState {
    key: String,
    limiter: MinIntervalLimiter,
    breaker: CircuitBreaker,
    last_used_millis: AtomicU64,
}

impl EndpointState {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limiter(&self) -> &MinIntervalLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(crate) fn touch(&self, now_millis: u64) {
        self.last_used_millis.store(now_millis, Ordering::Relaxed);
    }

    fn idle_for(&self, now_millis: u64) -> Duration {
        Duration::from_millis(now_millis.saturating_sub(self.last_used_millis.load(Ordering::Relaxed)))
    }
}

/// Registry of endpoint state, created lazily per key.
#[derive(Debug)]
pub struct EndpointRegistry {
    inner: Mutex<HashMap<String, Arc<EndpointState>>>,
    default_interval: Duration,
    interval_overrides: HashMap<String, Duration>,
    breaker_config: BreakerConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl EndpointRegistry {
    pub fn new(
        default_interval: Duration,
        interval_overrides: HashMap<String, Duration>,
        breaker_config: BreakerConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            default_interval,
            interval_overrides,
            breaker_config,
            clock,
            sleeper,
        }
    }

    /// Fetch the state for an endpoint, creating it on first use.
    pub fn get_or_create(&self, endpoint: &str) -> Arc<EndpointState> {
        let key = canonical_key(endpoint);
        let now = self.clock.now_millis();
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let state = map
            .entry(key.clone())
            .or_insert_with(|| {
                let interval = self
                    .interval_overrides
                    .get(&key)
                    .copied()
                    .unwrap_or(self.default_interval);
                Arc::new(EndpointState {
                    key: key.clone(),
                    limiter: MinIntervalLimiter::new(
                        interval,
                        self.clock.clone(),
                        self.sleeper.clone(),
                    ),
                    breaker: CircuitBreaker::new(self.breaker_config.clone(), self.clock.clone()),
                    last_used_millis: AtomicU64::new(now),
                })
            })
            .clone();
        state.touch(now);
        state
    }

    /// Drop state for endpoints unused for `ttl`. Returns how many were
    /// evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = self.clock.now_millis();
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = map.len();
        map.retain(|_, state| state.idle_for(now) < ttl);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breaker state per endpoint, sorted by key.
    pub fn breaker_snapshot(&self) -> Vec<(String, BreakerState)> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(String, BreakerState)> =
            map.iter().map(|(k, v)| (k.clone(), v.breaker.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
