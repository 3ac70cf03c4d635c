//! Retry backoff schedule with jitter.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Raw delay before retry `attempt` (1-indexed), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 2u32.saturating_pow(exponent);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(Duration::from_secs(u64::MAX))
            .min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// How to randomize a computed delay to spread retry storms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Exact delay.
    None,
    /// Uniform multiplier in [0.5, 1.0).
    #[default]
    Half,
    /// Uniform multiplier in [0.0, 1.0).
    Full,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply with a caller-supplied RNG for deterministic tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        match self {
            Self::None => delay,
            Self::Half => delay.mul_f64(rng.random_range(0.5..1.0)),
            Self::Full => delay.mul_f64(rng.random_range(0.0..1.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_doubles_per_attempt() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_respects_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(5), Duration::from_secs(16));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(u64::MAX));
        let delay = backoff.delay(64);
        assert!(delay >= Duration::from_secs(1 << 31));
    }

    #[test]
    fn half_jitter_stays_in_range() {
        let delay = Duration::from_millis(1000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let jittered = Jitter::Half.apply_with_rng(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered < delay);
        }
    }

    #[test]
    fn full_jitter_stays_in_range() {
        let delay = Duration::from_millis(1000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let jittered = Jitter::Full.apply_with_rng(delay, &mut rng);
            assert!(jittered < delay);
        }
    }

    #[test]
    fn no_jitter_returns_exact_delay() {
        let delay = Duration::from_millis(123);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(Jitter::None.apply_with_rng(delay, &mut rng), delay);
    }

    #[test]
    fn jitter_handles_zero_delay() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(Jitter::Half.apply_with_rng(Duration::ZERO, &mut rng), Duration::ZERO);
    }
}
