//! Rate-limited, retrying webhook sender with per-endpoint circuit breaking.
//!
//! One `send` drives the full attempt loop for an item: breaker gate,
//! rate-limiter slot, a single POST with a per-attempt timeout, response
//! classification, and jittered exponential backoff between retryable
//! attempts. Every attempt reports its result to the breaker exactly once;
//! outcomes are tagged variants, never unwinds.

use crate::backoff::{Backoff, Jitter};
use crate::breaker::BreakerState;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::endpoint::{canonical_key, EndpointRegistry};
use crate::error::ErrorKind;
use crate::item::{DeliveryOutcome, DropReason, Item};
use crate::metrics::PipelineMetrics;
use crate::sleeper::Sleeper;
use crate::trace::TraceContext;
use crate::transport::{Transport, TransportError, WebhookRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Sender knobs, extracted from the pipeline config.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Max attempts per item, across all retries.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
    pub per_attempt_timeout: Duration,
    /// Headers attached to every outbound request.
    pub headers: Vec<(String, String)>,
    /// Endpoint keys that accept a JSON array of payloads in one request.
    pub batch_endpoints: HashSet<String>,
}

impl From<&PipelineConfig> for SenderConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::new(config.retry_base, config.retry_cap),
            jitter: Jitter::Half,
            per_attempt_timeout: config.per_attempt_timeout,
            headers: config.headers.clone(),
            batch_endpoints: config.batch_endpoints.iter().map(|e| canonical_key(e)).collect(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Composes breaker, rate limiter, transport, and retry policy.
#[derive(Debug)]
pub struct WebhookSender {
    transport: Arc<dyn Transport>,
    endpoints: Arc<EndpointRegistry>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: SenderConfig,
}

impl WebhookSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Arc<EndpointRegistry>,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        config: SenderConfig,
    ) -> Self {
        Self { transport, endpoints, metrics, clock, sleeper, config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Deliver one item. Not reentrant per item; the caller holds the item
    /// exclusively while this runs.
    pub async fn send(
        &self,
        item: &mut Item,
        shard: usize,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let started = self.clock.now_millis();
        let trace = TraceContext::root();
        let mut last_status: Option<u16> = None;

        loop {
            if let Some(deadline) = item.deadline_at {
                if self.clock.now_millis() >= deadline {
                    item.last_error = Some(ErrorKind::DeadlineExceeded);
                    tracing::warn!(
                        item_id = %item.id,
                        endpoint = %item.endpoint,
                        attempt = item.attempts,
                        error_kind = %ErrorKind::DeadlineExceeded,
                        "item deadline elapsed"
                    );
                    let outcome = DeliveryOutcome::Failed {
                        kind: ErrorKind::DeadlineExceeded,
                        attempts: item.attempts,
                        last_status,
                    };
                    return self.finish(item, started, shard, outcome);
                }
            }

            let endpoint = self.endpoints.get_or_create(&item.endpoint);
            let permit = match endpoint.breaker().try_allow() {
                Ok(permit) => permit,
                Err(denied) => {
                    tracing::warn!(
                        item_id = %item.id,
                        endpoint = %endpoint.key(),
                        attempt = item.attempts,
                        error_kind = %ErrorKind::BreakerOpen,
                        consecutive_failures = denied.consecutive_failures,
                        "breaker denied send"
                    );
                    item.last_error = Some(ErrorKind::BreakerOpen);
                    let outcome = DeliveryOutcome::Failed {
                        kind: ErrorKind::BreakerOpen,
                        attempts: item.attempts,
                        last_status,
                    };
                    return self.finish(item, started, shard, outcome);
                }
            };
            if permit.is_probe() {
                self.metrics.breaker_transition(endpoint.key(), BreakerState::HalfOpen);
            }

            let waited = match endpoint.limiter().acquire(cancel).await {
                Ok(waited) => waited,
                // Dropping the unreported permit releases a probe slot.
                Err(_) => {
                    drop(permit);
                    let outcome = DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown };
                    return self.finish(item, started, shard, outcome);
                }
            };
            self.metrics.rate_limit_wait(endpoint.key(), waited);

            item.attempts += 1;
            let attempt = item.attempts;
            let attempt_trace = if attempt == 1 { trace } else { trace.child() };
            let span = tracing::info_span!(
                "webhook_send",
                item_id = %item.id,
                endpoint = %endpoint.key(),
                attempt,
                traceparent = %attempt_trace.traceparent(),
            );

            let request = WebhookRequest {
                url: item.endpoint.clone(),
                body: item.payload.clone(),
                headers: self.config.headers.clone(),
                traceparent: attempt_trace.traceparent(),
                timeout: self.config.per_attempt_timeout,
            };
            let post = self.transport.post(request).instrument(span);
            let attempt_result = tokio::select! {
                result = tokio::time::timeout(self.config.per_attempt_timeout, post) => {
                    result.unwrap_or_else(|_| Err(TransportError::timeout("attempt deadline elapsed")))
                }
                _ = cancel.cancelled() => {
                    drop(permit);
                    let outcome = DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown };
                    return self.finish(item, started, shard, outcome);
                }
            };

            match attempt_result {
                Ok(response) if response.is_success() => {
                    if let Some(state) = permit.record(true) {
                        self.metrics.breaker_transition(endpoint.key(), state);
                    }
                    item.last_error = None;
                    tracing::info!(
                        item_id = %item.id,
                        endpoint = %endpoint.key(),
                        attempt,
                        status = response.status,
                        "delivered"
                    );
                    let latency =
                        Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                    let outcome = DeliveryOutcome::Succeeded {
                        latency,
                        status: response.status,
                        attempts: attempt,
                    };
                    return self.finish(item, started, shard, outcome);
                }
                Ok(response) => {
                    let kind =
                        ErrorKind::from_status(response.status).unwrap_or(ErrorKind::Client4xx);
                    last_status = Some(response.status);
                    item.last_error = Some(kind);
                    if let Some(state) = permit.record(false) {
                        self.metrics.breaker_transition(endpoint.key(), state);
                    }
                    if kind.is_retryable() && attempt < self.config.max_retries {
                        if !self
                            .backoff_sleep(item, endpoint.key(), attempt, response.retry_after, cancel)
                            .await
                        {
                            let outcome =
                                DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown };
                            return self.finish(item, started, shard, outcome);
                        }
                        continue;
                    }
                    tracing::warn!(
                        item_id = %item.id,
                        endpoint = %endpoint.key(),
                        attempt,
                        error_kind = %kind,
                        status = response.status,
                        "delivery failed"
                    );
                    let outcome =
                        DeliveryOutcome::Failed { kind, attempts: attempt, last_status };
                    return self.finish(item, started, shard, outcome);
                }
                Err(err) => {
                    let kind = err.kind;
                    item.last_error = Some(kind);
                    if let Some(state) = permit.record(false) {
                        self.metrics.breaker_transition(endpoint.key(), state);
                    }
                    if attempt < self.config.max_retries {
                        if !self.backoff_sleep(item, endpoint.key(), attempt, None, cancel).await {
                            let outcome =
                                DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown };
                            return self.finish(item, started, shard, outcome);
                        }
                        continue;
                    }
                    tracing::warn!(
                        item_id = %item.id,
                        endpoint = %endpoint.key(),
                        attempt,
                        error_kind = %kind,
                        detail = %err.detail,
                        "delivery failed"
                    );
                    let outcome =
                        DeliveryOutcome::Failed { kind, attempts: attempt, last_status };
                    return self.finish(item, started, shard, outcome);
                }
            }
        }
    }

    /// Deliver items bound for one endpoint in a single request when the
    /// endpoint supports it; otherwise iterate `send`.
    ///
    /// The batch path makes one attempt. Positional failure indices from the
    /// reply surface per item; a reply without indices fails the whole batch
    /// and every item retries individually on its next dispatch. Outcomes
    /// flagged by [`Self::needs_individual_retry`] carry no final metrics
    /// yet for that reason.
    pub async fn send_batch(
        &self,
        items: &mut [Item],
        shard: usize,
        cancel: &CancellationToken,
    ) -> Vec<DeliveryOutcome> {
        if items.is_empty() {
            return Vec::new();
        }
        let key = canonical_key(&items[0].endpoint);
        if !self.config.batch_endpoints.contains(&key) {
            let mut outcomes = Vec::with_capacity(items.len());
            for item in items.iter_mut() {
                outcomes.push(self.send(item, shard, cancel).await);
            }
            return outcomes;
        }

        let started = self.clock.now_millis();
        let endpoint = self.endpoints.get_or_create(&items[0].endpoint);
        let permit = match endpoint.breaker().try_allow() {
            Ok(permit) => permit,
            Err(_) => {
                return items
                    .iter_mut()
                    .map(|item| {
                        item.last_error = Some(ErrorKind::BreakerOpen);
                        let outcome = DeliveryOutcome::Failed {
                            kind: ErrorKind::BreakerOpen,
                            attempts: item.attempts,
                            last_status: None,
                        };
                        self.finish(item, started, shard, outcome)
                    })
                    .collect();
            }
        };
        if permit.is_probe() {
            self.metrics.breaker_transition(endpoint.key(), BreakerState::HalfOpen);
        }
        let waited = match endpoint.limiter().acquire(cancel).await {
            Ok(waited) => waited,
            Err(_) => {
                drop(permit);
                return items
                    .iter()
                    .map(|_| DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown })
                    .collect();
            }
        };
        self.metrics.rate_limit_wait(endpoint.key(), waited);

        for item in items.iter_mut() {
            item.attempts += 1;
        }
        let trace = TraceContext::root();
        let span = tracing::info_span!(
            "webhook_send_batch",
            endpoint = %endpoint.key(),
            batch = items.len(),
            traceparent = %trace.traceparent(),
        );
        let request = WebhookRequest {
            url: items[0].endpoint.clone(),
            body: serde_json::Value::Array(items.iter().map(|i| i.payload.clone()).collect()),
            headers: self.config.headers.clone(),
            traceparent: trace.traceparent(),
            timeout: self.config.per_attempt_timeout,
        };
        let post = self.transport.post(request).instrument(span);
        let attempt_result = tokio::select! {
            result = tokio::time::timeout(self.config.per_attempt_timeout, post) => {
                result.unwrap_or_else(|_| Err(TransportError::timeout("attempt deadline elapsed")))
            }
            _ = cancel.cancelled() => {
                drop(permit);
                return items
                    .iter()
                    .map(|_| DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown })
                    .collect();
            }
        };

        match attempt_result {
            Ok(response) if response.is_success() => {
                if let Some(state) = permit.record(true) {
                    self.metrics.breaker_transition(endpoint.key(), state);
                }
                let failed = positional_failures(response.body.as_ref());
                let latency =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                items
                    .iter_mut()
                    .enumerate()
                    .map(|(index, item)| {
                        if failed.contains(&index) {
                            item.last_error = Some(ErrorKind::Server5xx);
                            self.batch_outcome(
                                item,
                                started,
                                shard,
                                DeliveryOutcome::Failed {
                                    kind: ErrorKind::Server5xx,
                                    attempts: item.attempts,
                                    last_status: Some(response.status),
                                },
                            )
                        } else {
                            item.last_error = None;
                            self.finish(
                                item,
                                started,
                                shard,
                                DeliveryOutcome::Succeeded {
                                    latency,
                                    status: response.status,
                                    attempts: item.attempts,
                                },
                            )
                        }
                    })
                    .collect()
            }
            Ok(response) => {
                let kind = ErrorKind::from_status(response.status).unwrap_or(ErrorKind::Client4xx);
                if let Some(state) = permit.record(false) {
                    self.metrics.breaker_transition(endpoint.key(), state);
                }
                items
                    .iter_mut()
                    .map(|item| {
                        item.last_error = Some(kind);
                        self.batch_outcome(
                            item,
                            started,
                            shard,
                            DeliveryOutcome::Failed {
                                kind,
                                attempts: item.attempts,
                                last_status: Some(response.status),
                            },
                        )
                    })
                    .collect()
            }
            Err(err) => {
                if let Some(state) = permit.record(false) {
                    self.metrics.breaker_transition(endpoint.key(), state);
                }
                items
                    .iter_mut()
                    .map(|item| {
                        item.last_error = Some(err.kind);
                        self.batch_outcome(
                            item,
                            started,
                            shard,
                            DeliveryOutcome::Failed {
                                kind: err.kind,
                                attempts: item.attempts,
                                last_status: None,
                            },
                        )
                    })
                    .collect()
            }
        }
    }

    /// Whether a batch outcome should be retried through `send` before it
    /// is treated as final.
    pub fn needs_individual_retry(&self, outcome: &DeliveryOutcome) -> bool {
        matches!(
            outcome,
            DeliveryOutcome::Failed { kind, attempts, .. }
                if kind.is_retryable() && *attempts < self.config.max_retries
        )
    }

    /// Sleep before the next attempt. Returns `false` when cancelled.
    async fn backoff_sleep(
        &self,
        item: &Item,
        endpoint_key: &str,
        failed_attempt: u32,
        retry_after: Option<Duration>,
        cancel: &CancellationToken,
    ) -> bool {
        self.metrics.retry(endpoint_key, failed_attempt);
        let mut delay = self.config.jitter.apply(self.config.backoff.delay(failed_attempt));
        if let Some(floor) = retry_after {
            delay = delay.max(floor);
        }
        tracing::debug!(
            item_id = %item.id,
            endpoint = %endpoint_key,
            attempt = failed_attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after backoff"
        );
        tokio::select! {
            _ = self.sleeper.sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Record a final outcome's metrics and hand it back.
    fn finish(
        &self,
        item: &Item,
        started: u64,
        shard: usize,
        outcome: DeliveryOutcome,
    ) -> DeliveryOutcome {
        let duration = Duration::from_millis(self.clock.now_millis().saturating_sub(started));
        self.metrics.send_outcome(&canonical_key(&item.endpoint), &outcome, duration, shard);
        outcome
    }

    /// Like `finish`, but skips metrics for outcomes the pool will retry
    /// individually, so the final `send` counts them once.
    fn batch_outcome(
        &self,
        item: &Item,
        started: u64,
        shard: usize,
        outcome: DeliveryOutcome,
    ) -> DeliveryOutcome {
        if self.needs_individual_retry(&outcome) {
            outcome
        } else {
            self.finish(item, started, shard, outcome)
        }
    }
}

/// Positional failure indices from a batch reply body, e.g.
/// `{"failed": [0, 2]}`. Missing or malformed indices yield the empty set.
fn positional_failures(body: Option<&serde_json::Value>) -> HashSet<usize> {
    body.and_then(|body| body.get("failed"))
        .and_then(|failed| failed.as_array())
        .map(|indices| {
            indices.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect()
        })
        .unwrap_or_default()
}
