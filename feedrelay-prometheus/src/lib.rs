//! Prometheus metrics sink for `feedrelay`.
//! Bring your own `prometheus::Registry`; the pipeline's stable metric
//! names are registered as counter, gauge, and histogram vectors and fed
//! from [`MetricEvent`]s.

use feedrelay::{metric_names as names, MetricEvent, MetricValue, MetricsSink};
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counters: Arc<HashMap<&'static str, IntCounterVec>>,
    gauges: Arc<HashMap<&'static str, GaugeVec>>,
    histograms: Arc<HashMap<&'static str, HistogramVec>>,
}

impl PrometheusSink {
    /// Create a sink and register every pipeline metric into the registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name
    /// conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();

        let mut counters = HashMap::new();
        for (name, help, labels) in [
            (names::ITEMS_ADMITTED_TOTAL, "Items admitted to the queue", &["priority"][..]),
            (names::ITEMS_REJECTED_TOTAL, "Items refused at admission", &["reason"][..]),
            (names::OVERFLOW_TOTAL, "Items displaced under overflow", &["lane"][..]),
            (names::SENDS_TOTAL, "Completed delivery attempts", &["endpoint", "outcome"][..]),
            (names::RETRIES_TOTAL, "Scheduled retries", &["endpoint", "attempt"][..]),
            (
                names::BREAKER_TRANSITIONS_TOTAL,
                "Circuit breaker transitions",
                &["endpoint", "to_state"][..],
            ),
        ] {
            let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            counters.insert(name, vec);
        }

        let mut gauges = HashMap::new();
        for (name, help, labels) in [
            (names::QUEUE_SIZE, "Queued items per lane", &["lane"][..]),
            (names::ACTIVE_WORKERS, "Workers currently running", &[][..]),
            (names::CURRENT_BATCH_SIZE, "Current tuned batch size", &[][..]),
            (
                names::RATE_LIMIT_WAIT_SECONDS,
                "Most recent rate-limit wait",
                &["endpoint"][..],
            ),
        ] {
            let vec = GaugeVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            gauges.insert(name, vec);
        }

        let mut histograms = HashMap::new();
        for (name, help, labels, buckets) in [
            (
                names::SEND_DURATION_SECONDS,
                "Delivery duration",
                &["endpoint"][..],
                prometheus::DEFAULT_BUCKETS.to_vec(),
            ),
            (
                names::ENQUEUE_TO_SEND_SECONDS,
                "Queue wait before dispatch",
                &[][..],
                prometheus::DEFAULT_BUCKETS.to_vec(),
            ),
            (
                names::BATCH_SIZE_OBSERVED,
                "Dispatched batch sizes",
                &[][..],
                prometheus::exponential_buckets(1.0, 2.0, 10)?,
            ),
        ] {
            let vec = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)?;
            registry.register(Box::new(vec.clone()))?;
            histograms.insert(name, vec);
        }

        Ok(Self {
            registry,
            counters: Arc::new(counters),
            gauges: Arc::new(gauges),
            histograms: Arc::new(histograms),
        })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn label_values<'a>(event: &'a MetricEvent) -> Vec<&'a str> {
        event.labels.iter().map(|(_, value)| value.as_str()).collect()
    }
}

impl tower_service::Service<MetricEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        let values = Self::label_values(&event);
        match event.value {
            MetricValue::CounterInc(by) => {
                if let Some(vec) = self.counters.get(event.name) {
                    vec.with_label_values(&values).inc_by(by);
                } else {
                    tracing::debug!(name = event.name, "unknown counter event");
                }
            }
            MetricValue::Gauge(value) => {
                if let Some(vec) = self.gauges.get(event.name) {
                    vec.with_label_values(&values).set(value);
                } else {
                    tracing::debug!(name = event.name, "unknown gauge event");
                }
            }
            MetricValue::Observation(value) => {
                if let Some(vec) = self.histograms.get(event.name) {
                    vec.with_label_values(&values).observe(value);
                } else {
                    tracing::debug!(name = event.name, "unknown histogram event");
                }
            }
        }
        ready(Ok(()))
    }
}

impl MetricsSink for PrometheusSink {
    type SinkError = Infallible;
}
