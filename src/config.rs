//! Flat pipeline configuration.
//!
//! One record, every recognized knob, validated up front. String key/value
//! application (for callers that load from flags or files) rejects unknown
//! keys instead of ignoring them.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// What to do when the queue is full and a new item arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Displace the oldest item from the lowest lane strictly below the
    /// incoming priority; reject if there is none.
    Displace,
    /// Always reject with `queue_full`.
    Reject,
}

/// Configuration rejected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("{0} must be > 0")]
    Zero(&'static str),
    #[error("{min_key} ({min}) must be <= {max_key} ({max})")]
    InvertedBounds { min_key: &'static str, min: usize, max_key: &'static str, max: usize },
    #[error("targetCPUPercent must be in (0, 100], got {0}")]
    BadCpuTarget(u32),
}

/// All recognized pipeline options.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-endpoint floor between sends.
    pub min_send_interval: Duration,
    /// Max attempts per item, across all retries.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub per_attempt_timeout: Duration,
    /// Consecutive failures before an endpoint's breaker opens.
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
    /// Aggregate queue bound across all lanes.
    pub queue_max_size: usize,
    pub overflow_policy: OverflowPolicy,
    /// Promote an item one lane after this long in its lane. Off by default.
    pub age_boost_interval: Option<Duration>,
    pub min_batch: usize,
    pub max_batch: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Tuning setpoint, percent.
    pub target_cpu_percent: u32,
    /// Shutdown drain deadline, and the controller's scale-down floor.
    pub drain_sla: Duration,
    /// Controller tick period.
    pub controller_tick: Duration,
    /// Budget for `Store::record`; slower stores are logged and skipped.
    pub store_timeout: Duration,
    /// Evict limiter/breaker state for endpoints idle this long.
    pub endpoint_idle_ttl: Duration,
    pub max_payload_bytes: usize,
    /// Optional global per-item deadline, checked at retry boundaries.
    pub item_deadline: Option<Duration>,
    /// Headers attached to every outbound request.
    pub headers: Vec<(String, String)>,
    /// Per-endpoint overrides of `min_send_interval`.
    pub endpoint_intervals: HashMap<String, Duration>,
    /// Endpoints that accept a JSON array of payloads in one request.
    pub batch_endpoints: HashSet<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_send_interval: Duration::from_millis(200),
            max_retries: 3,
            retry_base: Duration::from_millis(1000),
            retry_cap: Duration::from_millis(30_000),
            per_attempt_timeout: Duration::from_millis(10_000),
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_millis(30_000),
            queue_max_size: 1000,
            overflow_policy: OverflowPolicy::Displace,
            age_boost_interval: None,
            min_batch: 10,
            max_batch: 500,
            min_workers: 2,
            max_workers: 16,
            target_cpu_percent: 70,
            drain_sla: Duration::from_millis(30_000),
            controller_tick: Duration::from_secs(5),
            store_timeout: Duration::from_secs(2),
            endpoint_idle_ttl: Duration::from_secs(600),
            max_payload_bytes: 1 << 20,
            item_deadline: None,
            headers: Vec::new(),
            endpoint_intervals: HashMap::new(),
            batch_endpoints: HashSet::new(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("maxRetries"));
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::Zero("queueMaxSize"));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ConfigError::Zero("perAttemptTimeoutMs"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::Zero("breakerFailureThreshold"));
        }
        if self.min_batch == 0 {
            return Err(ConfigError::Zero("minBatch"));
        }
        if self.min_workers == 0 {
            return Err(ConfigError::Zero("minWorkers"));
        }
        if self.min_batch > self.max_batch {
            return Err(ConfigError::InvertedBounds {
                min_key: "minBatch",
                min: self.min_batch,
                max_key: "maxBatch",
                max: self.max_batch,
            });
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::InvertedBounds {
                min_key: "minWorkers",
                min: self.min_workers,
                max_key: "maxWorkers",
                max: self.max_workers,
            });
        }
        if self.target_cpu_percent == 0 || self.target_cpu_percent > 100 {
            return Err(ConfigError::BadCpuTarget(self.target_cpu_percent));
        }
        Ok(())
    }

    /// Apply one `key=value` pair. Unknown keys are errors, not warnings.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }

        match key {
            "minSendIntervalMs" => {
                self.min_send_interval = Duration::from_millis(parse(key, value)?);
            }
            "maxRetries" => self.max_retries = parse(key, value)?,
            "retryBaseMs" => self.retry_base = Duration::from_millis(parse(key, value)?),
            "retryCapMs" => self.retry_cap = Duration::from_millis(parse(key, value)?),
            "perAttemptTimeoutMs" => {
                self.per_attempt_timeout = Duration::from_millis(parse(key, value)?);
            }
            "breakerFailureThreshold" => self.breaker_failure_threshold = parse(key, value)?,
            "breakerResetTimeoutMs" => {
                self.breaker_reset_timeout = Duration::from_millis(parse(key, value)?);
            }
            "queueMaxSize" => self.queue_max_size = parse(key, value)?,
            "overflowPolicy" => {
                self.overflow_policy = match value {
                    "displace" => OverflowPolicy::Displace,
                    "reject" => OverflowPolicy::Reject,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                };
            }
            "ageBoostIntervalMs" => {
                self.age_boost_interval = match value {
                    "off" | "0" => None,
                    _ => Some(Duration::from_millis(parse(key, value)?)),
                };
            }
            "minBatch" => self.min_batch = parse(key, value)?,
            "maxBatch" => self.max_batch = parse(key, value)?,
            "minWorkers" => self.min_workers = parse(key, value)?,
            "maxWorkers" => self.max_workers = parse(key, value)?,
            "targetCPUPercent" => self.target_cpu_percent = parse(key, value)?,
            "drainSLAms" => self.drain_sla = Duration::from_millis(parse(key, value)?),
            "storeTimeoutMs" => self.store_timeout = Duration::from_millis(parse(key, value)?),
            "endpointIdleTtlMs" => {
                self.endpoint_idle_ttl = Duration::from_millis(parse(key, value)?);
            }
            "maxPayloadBytes" => self.max_payload_bytes = parse(key, value)?,
            "itemDeadlineMs" => {
                self.item_deadline = match value {
                    "off" | "0" => None,
                    _ => Some(Duration::from_millis(parse(key, value)?)),
                };
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Effective send interval for an endpoint key.
    pub fn interval_for(&self, endpoint_key: &str) -> Duration {
        self.endpoint_intervals.get(endpoint_key).copied().unwrap_or(self.min_send_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.min_send_interval, Duration::from_millis(200));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_base, Duration::from_secs(1));
        assert_eq!(cfg.retry_cap, Duration::from_secs(30));
        assert_eq!(cfg.per_attempt_timeout, Duration::from_secs(10));
        assert_eq!(cfg.breaker_failure_threshold, 5);
        assert_eq!(cfg.breaker_reset_timeout, Duration::from_secs(30));
        assert_eq!(cfg.queue_max_size, 1000);
        assert_eq!(cfg.overflow_policy, OverflowPolicy::Displace);
        assert_eq!(cfg.age_boost_interval, None);
        assert_eq!((cfg.min_batch, cfg.max_batch), (10, 500));
        assert_eq!((cfg.min_workers, cfg.max_workers), (2, 16));
        assert_eq!(cfg.target_cpu_percent, 70);
        assert_eq!(cfg.drain_sla, Duration::from_secs(30));
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut cfg = PipelineConfig::default();
        assert_eq!(
            cfg.apply("maxRetrys", "5"),
            Err(ConfigError::UnknownKey("maxRetrys".into()))
        );
    }

    #[test]
    fn apply_parses_each_recognized_key() {
        let mut cfg = PipelineConfig::default();
        cfg.apply("minSendIntervalMs", "50").unwrap();
        cfg.apply("maxRetries", "7").unwrap();
        cfg.apply("overflowPolicy", "reject").unwrap();
        cfg.apply("ageBoostIntervalMs", "1500").unwrap();
        cfg.apply("targetCPUPercent", "55").unwrap();
        assert_eq!(cfg.min_send_interval, Duration::from_millis(50));
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(cfg.age_boost_interval, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.target_cpu_percent, 55);
    }

    #[test]
    fn apply_rejects_garbage_values() {
        let mut cfg = PipelineConfig::default();
        assert!(matches!(
            cfg.apply("maxRetries", "many"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.apply("overflowPolicy", "panic"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut cfg = PipelineConfig::default();
        cfg.min_batch = 100;
        cfg.max_batch = 10;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvertedBounds { .. })));

        let mut cfg = PipelineConfig::default();
        cfg.min_workers = 32;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvertedBounds { .. })));
    }

    #[test]
    fn validate_rejects_zero_knobs() {
        let mut cfg = PipelineConfig::default();
        cfg.queue_max_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("queueMaxSize")));

        let mut cfg = PipelineConfig::default();
        cfg.target_cpu_percent = 101;
        assert_eq!(cfg.validate(), Err(ConfigError::BadCpuTarget(101)));
    }

    #[test]
    fn interval_overrides_fall_back_to_default() {
        let mut cfg = PipelineConfig::default();
        cfg.endpoint_intervals.insert("https://a.test".into(), Duration::from_millis(50));
        assert_eq!(cfg.interval_for("https://a.test"), Duration::from_millis(50));
        assert_eq!(cfg.interval_for("https://b.test"), Duration::from_millis(200));
    }
}
