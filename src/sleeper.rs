//! Abstraction over waiting so backoff and rate-limit delays can be
//! observed or skipped entirely in tests.
//!
//! Callers that need cancellation race the sleep against a
//! `CancellationToken` with `select!`; a cancelled sleep must not mutate any
//! component state, which is why the sleeper itself knows nothing about
//! cancellation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping between attempts and sends.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Sleeper that returns immediately; keeps deterministic tests fast.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Sleeper that records every requested duration without waiting.
///
/// Tests assert on the recorded schedule: backoff growth, jitter bounds,
/// and rate-limit spacing.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All durations requested so far, in order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Sum of all requested durations.
    pub fn total(&self) -> Duration {
        self.recorded().iter().sum()
    }

    pub fn clear(&self) {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
    }
}
