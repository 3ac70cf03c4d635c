//! Metrics plumbing: stable names, a lock-free in-process registry, and
//! pluggable sinks.
//!
//! Counters and gauges are plain atomics; histograms are sharded by worker so
//! the hot path never takes a lock. Every update also produces a
//! [`MetricEvent`] that is forwarded best-effort to the configured sink
//! through a bounded channel (a saturated sink drops events and counts the
//! drops rather than stalling delivery).
//!
//! Sinks are `tower_service::Service<MetricEvent>` implementations so they
//! compose; `NullSink`, `LogSink`, and `MemorySink` live here, and a
//! Prometheus-backed sink ships as the `feedrelay-prometheus` member.

use crate::breaker::BreakerState;
use crate::item::{DeliveryOutcome, Priority, RejectReason};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tower_service::Service;

/// Stable metric names. These are the public observability contract.
pub mod names {
    pub const ITEMS_ADMITTED_TOTAL: &str = "items_admitted_total";
    pub const ITEMS_REJECTED_TOTAL: &str = "items_rejected_total";
    pub const OVERFLOW_TOTAL: &str = "overflow_total";
    pub const SENDS_TOTAL: &str = "sends_total";
    pub const RETRIES_TOTAL: &str = "retries_total";
    pub const BREAKER_TRANSITIONS_TOTAL: &str = "breaker_transitions_total";
    pub const QUEUE_SIZE: &str = "queue_size";
    pub const ACTIVE_WORKERS: &str = "active_workers";
    pub const CURRENT_BATCH_SIZE: &str = "current_batch_size";
    pub const RATE_LIMIT_WAIT_SECONDS: &str = "rate_limit_wait_seconds";
    pub const SEND_DURATION_SECONDS: &str = "send_duration_seconds";
    pub const ENQUEUE_TO_SEND_SECONDS: &str = "enqueue_to_send_seconds";
    pub const BATCH_SIZE_OBSERVED: &str = "batch_size_observed";
}

/// The value part of one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    CounterInc(u64),
    Gauge(f64),
    Observation(f64),
}

/// One observation flowing to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: MetricValue,
}

impl MetricEvent {
    pub fn counter(name: &'static str, labels: Vec<(&'static str, String)>, by: u64) -> Self {
        Self { name, labels, value: MetricValue::CounterInc(by) }
    }

    pub fn gauge(name: &'static str, labels: Vec<(&'static str, String)>, value: f64) -> Self {
        Self { name, labels, value: MetricValue::Gauge(value) }
    }

    pub fn observation(
        name: &'static str,
        labels: Vec<(&'static str, String)>,
        value: f64,
    ) -> Self {
        Self { name, labels, value: MetricValue::Observation(value) }
    }
}

/// A metrics sink consumes observation events.
pub trait MetricsSink:
    Service<MetricEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Boxed, clonable sink handle the pipeline stores.
pub type SinkHandle = BoxCloneService<MetricEvent, (), Box<dyn std::error::Error + Send + Sync>>;

/// Erase a concrete sink into a [`SinkHandle`].
pub fn boxed_sink<S>(sink: S) -> SinkHandle
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    BoxCloneService::new(
        sink.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    )
}

/// Sink that discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<MetricEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: MetricEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl MetricsSink for NullSink {
    type SinkError = Infallible;
}

/// Sink that logs every event through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<MetricEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        tracing::debug!(name = event.name, labels = ?event.labels, value = ?event.value, "metric");
        ready(Ok(()))
    }
}

impl MetricsSink for LogSink {
    type SinkError = Infallible;
}

/// Sink that buffers events in memory, for tests and inspection.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Events with the given metric name.
    pub fn named(&self, name: &str) -> Vec<MetricEvent> {
        self.events().into_iter().filter(|e| e.name == name).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<MetricEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        ready(Ok(()))
    }
}

impl MetricsSink for MemorySink {
    type SinkError = Infallible;
}

const SEND_DURATION_BOUNDS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const BATCH_SIZE_BOUNDS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0];
const HISTOGRAM_SHARDS: usize = 8;

#[derive(Debug)]
struct HistogramShard {
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

/// Worker-sharded histogram; `record` touches only the caller's shard.
#[derive(Debug)]
struct ShardedHistogram {
    bounds: &'static [f64],
    shards: Vec<HistogramShard>,
}

impl ShardedHistogram {
    fn new(bounds: &'static [f64]) -> Self {
        let shards = (0..HISTOGRAM_SHARDS)
            .map(|_| HistogramShard {
                bucket_counts: (0..bounds.len()).map(|_| AtomicU64::new(0)).collect(),
                count: AtomicU64::new(0),
                sum_micros: AtomicU64::new(0),
            })
            .collect();
        Self { bounds, shards }
    }

    fn record(&self, shard_hint: usize, value: f64) {
        let shard = &self.shards[shard_hint % HISTOGRAM_SHARDS];
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                shard.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        shard.count.fetch_add(1, Ordering::Relaxed);
        shard.sum_micros.fetch_add((value * 1e6) as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets: Vec<(f64, u64)> = self.bounds.iter().map(|b| (*b, 0)).collect();
        let mut count = 0u64;
        let mut sum_micros = 0u64;
        for shard in &self.shards {
            for (i, slot) in shard.bucket_counts.iter().enumerate() {
                buckets[i].1 += slot.load(Ordering::Relaxed);
            }
            count += shard.count.load(Ordering::Relaxed);
            sum_micros += shard.sum_micros.load(Ordering::Relaxed);
        }
        // Cumulative, prometheus-style.
        for i in 1..buckets.len() {
            buckets[i].1 += buckets[i - 1].1;
        }
        HistogramSnapshot { count, sum: sum_micros as f64 / 1e6, buckets }
    }
}

/// Merged view of one histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    /// Cumulative `(upper_bound, count)` pairs.
    pub buckets: Vec<(f64, u64)>,
}

/// Counter totals for rejected admissions, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectedCounts {
    pub queue_full: u64,
    pub duplicate: u64,
    pub validation_failed: u64,
    pub shutting_down: u64,
}

/// Complete point-in-time view of the pipeline's metrics.
///
/// Always complete, including during shutdown; gauges are equal and counters
/// non-decreasing across consecutive snapshots with no intervening activity.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub admitted: [u64; 3],
    pub rejected: RejectedCounts,
    pub overflow: [u64; 3],
    pub sends_success: u64,
    pub sends_failed: u64,
    pub sends_dropped: u64,
    pub retries: u64,
    pub breaker_opened: u64,
    pub breaker_half_opened: u64,
    pub breaker_closed: u64,
    pub queue_size: [u64; 3],
    pub active_workers: u64,
    pub current_batch_size: u64,
    /// Most recently observed rate-limit wait, seconds.
    pub rate_limit_wait_seconds: f64,
    /// Sink events dropped because the forwarding channel was full.
    pub sink_events_dropped: u64,
    pub send_duration: HistogramSnapshot,
    pub enqueue_to_send: HistogramSnapshot,
    pub batch_size_observed: HistogramSnapshot,
}

fn reject_idx(reason: RejectReason) -> usize {
    match reason {
        RejectReason::QueueFull => 0,
        RejectReason::Duplicate => 1,
        RejectReason::ValidationFailed => 2,
        RejectReason::ShuttingDown => 3,
    }
}

/// Lock-free metrics registry shared by queue, sender, and pool.
#[derive(Debug)]
pub struct PipelineMetrics {
    admitted: [AtomicU64; 3],
    rejected: [AtomicU64; 4],
    overflow: [AtomicU64; 3],
    sends_success: AtomicU64,
    sends_failed: AtomicU64,
    sends_dropped: AtomicU64,
    retries: AtomicU64,
    breaker_opened: AtomicU64,
    breaker_half_opened: AtomicU64,
    breaker_closed: AtomicU64,
    queue_size: [AtomicU64; 3],
    active_workers: AtomicU64,
    current_batch_size: AtomicU64,
    rate_limit_wait_micros: AtomicU64,
    sink_events_dropped: AtomicU64,
    send_duration: ShardedHistogram,
    enqueue_to_send: ShardedHistogram,
    batch_size_observed: ShardedHistogram,
    sink_tx: Option<tokio::sync::mpsc::Sender<MetricEvent>>,
}

impl PipelineMetrics {
    /// Registry with no external sink.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Registry forwarding events to `sink` through a bounded channel.
    ///
    /// Spawns the forwarding task, so this must be called inside a tokio
    /// runtime.
    pub fn with_sink(sink: SinkHandle, channel_capacity: usize) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<MetricEvent>(channel_capacity.max(1));
        let mut sink = sink;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready_sink) => {
                        if let Err(err) = ready_sink.call(event).await {
                            tracing::debug!(error = %err, "metrics sink rejected event");
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "metrics sink not ready");
                    }
                }
            }
        });
        Self::build(Some(tx))
    }

    fn build(sink_tx: Option<tokio::sync::mpsc::Sender<MetricEvent>>) -> Self {
        Self {
            admitted: Default::default(),
            rejected: Default::default(),
            overflow: Default::default(),
            sends_success: AtomicU64::new(0),
            sends_failed: AtomicU64::new(0),
            sends_dropped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            breaker_opened: AtomicU64::new(0),
            breaker_half_opened: AtomicU64::new(0),
            breaker_closed: AtomicU64::new(0),
            queue_size: Default::default(),
            active_workers: AtomicU64::new(0),
            current_batch_size: AtomicU64::new(0),
            rate_limit_wait_micros: AtomicU64::new(0),
            sink_events_dropped: AtomicU64::new(0),
            send_duration: ShardedHistogram::new(SEND_DURATION_BOUNDS),
            enqueue_to_send: ShardedHistogram::new(SEND_DURATION_BOUNDS),
            batch_size_observed: ShardedHistogram::new(BATCH_SIZE_BOUNDS),
            sink_tx,
        }
    }

    fn emit(&self, event: MetricEvent) {
        if let Some(tx) = &self.sink_tx {
            if tx.try_send(event).is_err() {
                self.sink_events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn admitted(&self, priority: Priority) {
        self.admitted[priority.lane()].fetch_add(1, Ordering::Relaxed);
        self.emit(MetricEvent::counter(
            names::ITEMS_ADMITTED_TOTAL,
            vec![("priority", priority.as_str().to_string())],
            1,
        ));
    }

    pub fn rejected(&self, reason: RejectReason) {
        self.rejected[reject_idx(reason)].fetch_add(1, Ordering::Relaxed);
        self.emit(MetricEvent::counter(
            names::ITEMS_REJECTED_TOTAL,
            vec![("reason", reason.as_str().to_string())],
            1,
        ));
    }

    pub fn overflow(&self, lane: Priority) {
        self.overflow[lane.lane()].fetch_add(1, Ordering::Relaxed);
        self.emit(MetricEvent::counter(
            names::OVERFLOW_TOTAL,
            vec![("lane", lane.as_str().to_string())],
            1,
        ));
    }

    /// Final outcome of one item's delivery attempt sequence.
    pub fn send_outcome(
        &self,
        endpoint: &str,
        outcome: &DeliveryOutcome,
        duration: Duration,
        shard: usize,
    ) {
        match outcome {
            DeliveryOutcome::Succeeded { .. } => {
                self.sends_success.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Failed { .. } => {
                self.sends_failed.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Dropped { .. } => {
                self.sends_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        let secs = duration.as_secs_f64();
        self.send_duration.record(shard, secs);
        self.emit(MetricEvent::counter(
            names::SENDS_TOTAL,
            vec![("endpoint", endpoint.to_string()), ("outcome", outcome.label().to_string())],
            1,
        ));
        self.emit(MetricEvent::observation(
            names::SEND_DURATION_SECONDS,
            vec![("endpoint", endpoint.to_string())],
            secs,
        ));
    }

    /// A retry is being scheduled after failed attempt number `attempt`.
    pub fn retry(&self, endpoint: &str, attempt: u32) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.emit(MetricEvent::counter(
            names::RETRIES_TOTAL,
            vec![("endpoint", endpoint.to_string()), ("attempt", attempt.to_string())],
            1,
        ));
    }

    pub fn breaker_transition(&self, endpoint: &str, to: BreakerState) {
        match to {
            BreakerState::Open => self.breaker_opened.fetch_add(1, Ordering::Relaxed),
            BreakerState::HalfOpen => self.breaker_half_opened.fetch_add(1, Ordering::Relaxed),
            BreakerState::Closed => self.breaker_closed.fetch_add(1, Ordering::Relaxed),
        };
        self.emit(MetricEvent::counter(
            names::BREAKER_TRANSITIONS_TOTAL,
            vec![("endpoint", endpoint.to_string()), ("to_state", to.as_str().to_string())],
            1,
        ));
    }

    pub fn rate_limit_wait(&self, endpoint: &str, waited: Duration) {
        self.rate_limit_wait_micros.store(waited.as_micros() as u64, Ordering::Relaxed);
        self.emit(MetricEvent::gauge(
            names::RATE_LIMIT_WAIT_SECONDS,
            vec![("endpoint", endpoint.to_string())],
            waited.as_secs_f64(),
        ));
    }

    pub fn enqueue_to_send(&self, waited: Duration, shard: usize) {
        let secs = waited.as_secs_f64();
        self.enqueue_to_send.record(shard, secs);
        self.emit(MetricEvent::observation(names::ENQUEUE_TO_SEND_SECONDS, vec![], secs));
    }

    pub fn batch_observed(&self, size: usize, shard: usize) {
        self.batch_size_observed.record(shard, size as f64);
        self.emit(MetricEvent::observation(names::BATCH_SIZE_OBSERVED, vec![], size as f64));
    }

    pub fn set_queue_sizes(&self, sizes: [usize; 3]) {
        for (lane, size) in sizes.iter().enumerate() {
            self.queue_size[lane].store(*size as u64, Ordering::Relaxed);
            let priority = Priority::from_lane(lane).expect("three lanes");
            self.emit(MetricEvent::gauge(
                names::QUEUE_SIZE,
                vec![("lane", priority.as_str().to_string())],
                *size as f64,
            ));
        }
    }

    pub fn set_active_workers(&self, count: usize) {
        self.active_workers.store(count as u64, Ordering::Relaxed);
        self.emit(MetricEvent::gauge(names::ACTIVE_WORKERS, vec![], count as f64));
    }

    pub fn set_batch_size(&self, size: usize) {
        self.current_batch_size.store(size as u64, Ordering::Relaxed);
        self.emit(MetricEvent::gauge(names::CURRENT_BATCH_SIZE, vec![], size as f64));
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        Snapshot {
            admitted: [
                load(&self.admitted[0]),
                load(&self.admitted[1]),
                load(&self.admitted[2]),
            ],
            rejected: RejectedCounts {
                queue_full: load(&self.rejected[0]),
                duplicate: load(&self.rejected[1]),
                validation_failed: load(&self.rejected[2]),
                shutting_down: load(&self.rejected[3]),
            },
            overflow: [
                load(&self.overflow[0]),
                load(&self.overflow[1]),
                load(&self.overflow[2]),
            ],
            sends_success: load(&self.sends_success),
            sends_failed: load(&self.sends_failed),
            sends_dropped: load(&self.sends_dropped),
            retries: load(&self.retries),
            breaker_opened: load(&self.breaker_opened),
            breaker_half_opened: load(&self.breaker_half_opened),
            breaker_closed: load(&self.breaker_closed),
            queue_size: [
                load(&self.queue_size[0]),
                load(&self.queue_size[1]),
                load(&self.queue_size[2]),
            ],
            active_workers: load(&self.active_workers),
            current_batch_size: load(&self.current_batch_size),
            rate_limit_wait_seconds: load(&self.rate_limit_wait_micros) as f64 / 1e6,
            sink_events_dropped: load(&self.sink_events_dropped),
            send_duration: self.send_duration.snapshot(),
            enqueue_to_send: self.enqueue_to_send.snapshot(),
            batch_size_observed: self.batch_size_observed.snapshot(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn counters_land_in_the_snapshot() {
        let metrics = PipelineMetrics::new();
        metrics.admitted(Priority::High);
        metrics.admitted(Priority::High);
        metrics.admitted(Priority::Low);
        metrics.rejected(RejectReason::Duplicate);
        metrics.overflow(Priority::Low);

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, [2, 0, 1]);
        assert_eq!(snap.rejected.duplicate, 1);
        assert_eq!(snap.rejected.queue_full, 0);
        assert_eq!(snap.overflow, [0, 0, 1]);
    }

    #[test]
    fn send_outcomes_split_by_class() {
        let metrics = PipelineMetrics::new();
        let ok = DeliveryOutcome::Succeeded {
            latency: Duration::from_millis(10),
            status: 200,
            attempts: 1,
        };
        let failed = DeliveryOutcome::Failed {
            kind: ErrorKind::Client4xx,
            attempts: 1,
            last_status: Some(400),
        };
        metrics.send_outcome("https://a.test", &ok, Duration::from_millis(10), 0);
        metrics.send_outcome("https://a.test", &failed, Duration::from_millis(5), 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.sends_success, 1);
        assert_eq!(snap.sends_failed, 1);
        assert_eq!(snap.send_duration.count, 2);
        assert!(snap.send_duration.sum > 0.0);
    }

    #[test]
    fn snapshots_without_activity_are_equal() {
        let metrics = PipelineMetrics::new();
        metrics.admitted(Priority::Normal);
        metrics.set_queue_sizes([0, 1, 0]);
        assert_eq!(metrics.snapshot(), metrics.snapshot());
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = PipelineMetrics::new();
        metrics.batch_observed(1, 0);
        metrics.batch_observed(3, 1);
        metrics.batch_observed(400, 2);

        let snap = metrics.snapshot().batch_size_observed;
        assert_eq!(snap.count, 3);
        let last = snap.buckets.last().unwrap();
        assert_eq!(last.1, 3);
        // (1.0, _) bucket holds only the first observation.
        assert_eq!(snap.buckets[0], (1.0, 1));
    }

    #[tokio::test]
    async fn events_flow_to_the_sink() {
        let sink = MemorySink::new();
        let metrics = PipelineMetrics::with_sink(boxed_sink(sink.clone()), 64);
        metrics.admitted(Priority::High);
        metrics.retry("https://a.test", 1);

        // Forwarding is async; give the task a moment to drain.
        for _ in 0..50 {
            if sink.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let admitted = sink.named(names::ITEMS_ADMITTED_TOTAL);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].labels, vec![("priority", "high".to_string())]);
        assert_eq!(sink.named(names::RETRIES_TOTAL).len(), 1);
    }

    #[test]
    fn memory_sink_evicts_at_capacity() {
        let mut sink = MemorySink::with_capacity(2);
        for i in 0..4u64 {
            let _ = sink.call(MetricEvent::counter(names::RETRIES_TOTAL, vec![], i));
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 2);
    }
}
