//! Pipeline facade: admission, stats, and shutdown.
//!
//! The builder constructs one context bundle (clock, sleeper, queue,
//! endpoint registry, metrics, sender, pool) and passes it explicitly;
//! there are no globals. `enqueue` is synchronous; everything behind it is
//! driven by the worker pool.

use crate::breaker::{BreakerConfig, BreakerState};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, PipelineConfig};
use crate::endpoint::{canonical_key, EndpointRegistry};
use crate::error::ErrorKind;
use crate::item::{AdmissionResult, DeliveryOutcome, DropReason, Item, RejectReason};
use crate::metrics::{PipelineMetrics, SinkHandle, Snapshot};
use crate::pool::{DrainReport, WorkerPool};
use crate::queue::{Enqueued, PriorityQueue};
use crate::sender::{SenderConfig, WebhookSender};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{NullStore, Store};
use crate::transport::{HttpTransport, Transport};
use crate::tuner::{CpuSampler, SysinfoCpuSampler};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Construction failures.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to construct the HTTP transport: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Builder for [`Pipeline`]; every collaborator is injectable.
pub struct PipelineBuilder {
    config: PipelineConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Option<SinkHandle>,
    cpu_sampler: Option<Box<dyn CpuSampler>>,
}

impl PipelineBuilder {
    /// Start a builder; the configuration is validated here.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            transport: None,
            store: Arc::new(NullStore),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            sink: None,
            cpu_sampler: None,
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics_sink(mut self, sink: SinkHandle) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cpu_sampler(mut self, sampler: Box<dyn CpuSampler>) -> Self {
        self.cpu_sampler = Some(sampler);
        self
    }

    /// Wire the components and start workers and the controller.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Pipeline, BuildError> {
        let config = self.config;
        let clock = self.clock;
        let sleeper = self.sleeper;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let metrics = Arc::new(match self.sink {
            Some(sink) => PipelineMetrics::with_sink(sink, 1024),
            None => PipelineMetrics::new(),
        });
        let queue = Arc::new(PriorityQueue::new(
            config.queue_max_size,
            config.overflow_policy,
            config.age_boost_interval,
            clock.clone(),
        ));
        let interval_overrides = config
            .endpoint_intervals
            .iter()
            .map(|(endpoint, interval)| (canonical_key(endpoint), *interval))
            .collect();
        let endpoints = Arc::new(EndpointRegistry::new(
            config.min_send_interval,
            interval_overrides,
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                reset_timeout: config.breaker_reset_timeout,
            },
            clock.clone(),
            sleeper.clone(),
        ));
        let sender = Arc::new(WebhookSender::new(
            transport,
            endpoints.clone(),
            metrics.clone(),
            clock.clone(),
            sleeper,
            SenderConfig::from(&config),
        ));
        let cancel = CancellationToken::new();
        let cpu_sampler =
            self.cpu_sampler.unwrap_or_else(|| Box::new(SysinfoCpuSampler::new()));
        let pool = WorkerPool::start(
            queue.clone(),
            sender,
            self.store.clone(),
            metrics.clone(),
            endpoints.clone(),
            clock.clone(),
            config.clone(),
            cpu_sampler,
            cancel.clone(),
        );

        Ok(Pipeline {
            config,
            clock,
            queue,
            endpoints,
            metrics,
            pool,
            store: self.store,
            runtime: tokio::runtime::Handle::current(),
            cancel,
        })
    }
}

/// The delivery pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<PriorityQueue>,
    endpoints: Arc<EndpointRegistry>,
    metrics: Arc<PipelineMetrics>,
    pool: Arc<WorkerPool>,
    store: Arc<dyn Store>,
    runtime: tokio::runtime::Handle,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> Result<PipelineBuilder, ConfigError> {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate and admit one item, synchronously.
    pub fn enqueue(&self, mut item: Item) -> AdmissionResult {
        if let Err(err) = item.validate(self.config.max_payload_bytes) {
            tracing::warn!(
                item_id = %item.id,
                endpoint = %item.endpoint,
                error_kind = %ErrorKind::ValidationFailed,
                error = %err,
                "item rejected at admission"
            );
            self.metrics.rejected(RejectReason::ValidationFailed);
            return AdmissionResult::Rejected(RejectReason::ValidationFailed);
        }
        if let Some(deadline) = self.config.item_deadline {
            item.deadline_at = Some(self.clock.now_millis() + deadline.as_millis() as u64);
        }
        let priority = item.priority;
        match self.queue.enqueue(item) {
            Enqueued::Admitted { displaced } => {
                self.metrics.admitted(priority);
                if let Some(victim) = displaced {
                    self.metrics.overflow(victim.priority);
                    tracing::warn!(
                        item_id = %victim.id,
                        lane = victim.priority.as_str(),
                        "item displaced by higher-priority arrival"
                    );
                    let store = self.store.clone();
                    let timeout = self.config.store_timeout;
                    self.runtime.spawn(async move {
                        let outcome = DeliveryOutcome::Dropped { reason: DropReason::Displaced };
                        let _ = tokio::time::timeout(timeout, store.record(&victim, &outcome)).await;
                    });
                }
                self.metrics.set_queue_sizes(self.queue.size_by_lane());
                AdmissionResult::Admitted
            }
            Enqueued::Rejected(reason) => {
                self.metrics.rejected(reason);
                AdmissionResult::Rejected(reason)
            }
        }
    }

    /// Complete metrics snapshot; remains available during shutdown.
    pub fn stats(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Queued items across all lanes.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Items a worker currently holds.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Per-endpoint breaker states, sorted by endpoint key.
    pub fn breaker_states(&self) -> Vec<(String, BreakerState)> {
        self.endpoints.breaker_snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled() || self.queue.is_closed()
    }

    /// Close the queue, drain up to `deadline`, cancel the rest, and join
    /// all workers. Use `config().drain_sla` for the configured deadline.
    pub async fn shutdown(&self, deadline: Duration) -> DrainReport {
        self.pool.shutdown(deadline).await
    }
}
