//! Error taxonomy shared by admission, delivery, and metrics.

use std::fmt;

/// Classification of delivery and admission failures.
///
/// A closed set: the `as_str` names are stable and double as metric label
/// values and structured-log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Item failed precondition checks (missing fields, oversize payload).
    ValidationFailed,
    /// Fingerprint already queued or in flight.
    Duplicate,
    /// Queue bound reached and the overflow policy is `reject`.
    QueueFull,
    /// The endpoint's circuit breaker is denying sends.
    BreakerOpen,
    /// HTTP 429 or an explicit `Retry-After`.
    RateLimitedUpstream,
    /// Per-attempt timeout expired.
    Timeout,
    /// Transport failure: DNS, TCP, TLS, connection reset.
    Network,
    /// HTTP 500-599.
    Server5xx,
    /// HTTP 4xx other than 408/425/429; terminal.
    Client4xx,
    /// The item's global deadline elapsed.
    DeadlineExceeded,
    /// The pipeline is closing.
    ShuttingDown,
}

impl ErrorKind {
    /// Whether the sender may retry an attempt that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimitedUpstream | Self::Timeout | Self::Network | Self::Server5xx
        )
    }

    /// Terminal kinds stop the retry loop immediately.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Client4xx | Self::ValidationFailed | Self::DeadlineExceeded)
    }

    /// Stable snake_case name, used as a metric label and log field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::Duplicate => "duplicate",
            Self::QueueFull => "queue_full",
            Self::BreakerOpen => "breaker_open",
            Self::RateLimitedUpstream => "rate_limited_upstream",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server5xx => "server_5xx",
            Self::Client4xx => "client_4xx",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Classify an HTTP status code, `None` for 2xx.
    ///
    /// 408 is treated as a timeout and 425 as upstream pushback, so both stay
    /// retryable; every other 4xx (and 3xx, which a webhook should never
    /// return) is terminal.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            408 => Some(Self::Timeout),
            425 | 429 => Some(Self::RateLimitedUpstream),
            500..=599 => Some(Self::Server5xx),
            _ => Some(Self::Client4xx),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorKind {}

/// Exit codes for process supervisors wrapping the pipeline.
pub mod exit_code {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Configuration rejected at startup.
    pub const BAD_CONFIG: i32 = 64;
    /// Fetcher unavailable on boot.
    pub const FETCHER_UNAVAILABLE: i32 = 65;
    /// Internal error observed at shutdown.
    pub const INTERNAL: i32 = 70;
}
