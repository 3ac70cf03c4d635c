//! Worker pool and adaptive dispatcher.
//!
//! N workers loop dequeue-batch → send → record; a periodic controller
//! re-tunes batch size and worker count from observed load. Tuning changes
//! apply at the next dequeue boundary: a worker whose index falls outside
//! the desired count exits there, and the controller respawns indices that
//! come back into range.

use crate::adaptive::Adaptive;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::endpoint::EndpointRegistry;
use crate::item::{DeliveryOutcome, Item};
use crate::metrics::PipelineMetrics;
use crate::queue::PriorityQueue;
use crate::sender::WebhookSender;
use crate::store::Store;
use crate::tuner::{AdaptiveTuner, CpuSampler, LoadSample, Tuning, TunerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Summary returned by shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Items that reached a final outcome over the pool's lifetime.
    pub completed: u64,
    /// Items still queued when the drain deadline expired.
    pub unfinished: usize,
    /// Items cancelled mid-flight.
    pub cancelled_in_flight: usize,
    pub elapsed: Duration,
}

pub(crate) struct WorkerPool {
    queue: Arc<PriorityQueue>,
    sender: Arc<WebhookSender>,
    store: Arc<dyn Store>,
    metrics: Arc<PipelineMetrics>,
    endpoints: Arc<EndpointRegistry>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    tuning: Adaptive<Tuning>,
    cancel: CancellationToken,
    active_workers: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    /// Worker join handles, indexed by worker id.
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        queue: Arc<PriorityQueue>,
        sender: Arc<WebhookSender>,
        store: Arc<dyn Store>,
        metrics: Arc<PipelineMetrics>,
        endpoints: Arc<EndpointRegistry>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
        cpu_sampler: Box<dyn CpuSampler>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let tuning =
            Adaptive::new(Tuning { batch_size: config.min_batch, workers: config.min_workers });
        let worker_slots = (0..config.max_workers).map(|_| None).collect();
        let pool = Arc::new(Self {
            queue,
            sender,
            store,
            metrics,
            endpoints,
            clock,
            config,
            tuning,
            cancel,
            active_workers: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(worker_slots),
            controller: Mutex::new(None),
        });
        pool.metrics.set_batch_size(pool.tuning.get().batch_size);
        pool.ensure_workers();
        let controller = tokio::spawn(controller_loop(pool.clone(), cpu_sampler));
        *pool.controller.lock().unwrap_or_else(|p| p.into_inner()) = Some(controller);
        pool
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Spawn workers for every index inside the desired count whose slot is
    /// empty or finished.
    fn ensure_workers(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.queue.is_closed() {
            return;
        }
        let desired = self.tuning.get().workers.min(self.config.max_workers);
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for id in 0..desired {
            let vacant = workers[id].as_ref().map(JoinHandle::is_finished).unwrap_or(true);
            if vacant {
                self.active_workers.fetch_add(1, Ordering::AcqRel);
                workers[id] = Some(tokio::spawn(worker_loop(self.clone(), id)));
            }
        }
        drop(workers);
        self.metrics.set_active_workers(self.active_workers.load(Ordering::Acquire));
    }

    /// Deliver one dequeued batch, grouping consecutive same-endpoint runs
    /// so batch-capable endpoints get one request.
    async fn deliver(&self, batch: Vec<Item>, shard: usize) {
        let now = self.clock.now_millis();
        for item in &batch {
            if let Some(enqueued_at) = item.enqueued_at {
                self.metrics
                    .enqueue_to_send(Duration::from_millis(now.saturating_sub(enqueued_at)), shard);
            }
        }
        let mut items = batch.into_iter().peekable();
        while let Some(first) = items.next() {
            let mut group = vec![first];
            while items.peek().map(|i| i.endpoint == group[0].endpoint).unwrap_or(false) {
                group.push(items.next().expect("peeked"));
            }
            self.deliver_group(group, shard).await;
        }
    }

    async fn deliver_group(&self, mut group: Vec<Item>, shard: usize) {
        self.in_flight.fetch_add(group.len(), Ordering::AcqRel);
        if group.len() == 1 {
            let mut item = group.pop().expect("single-item group");
            let outcome = self.sender.send(&mut item, shard, &self.cancel).await;
            self.complete(item, outcome).await;
        } else {
            let outcomes = self.sender.send_batch(&mut group, shard, &self.cancel).await;
            for (mut item, mut outcome) in group.into_iter().zip(outcomes) {
                if self.sender.needs_individual_retry(&outcome) {
                    outcome = self.sender.send(&mut item, shard, &self.cancel).await;
                }
                self.complete(item, outcome).await;
            }
        }
    }

    /// Store write and fingerprint release happen strictly after the outcome
    /// is final.
    async fn complete(&self, item: Item, outcome: DeliveryOutcome) {
        self.record_store(&item, &outcome).await;
        self.queue.complete(&item.fingerprint);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) async fn record_store(&self, item: &Item, outcome: &DeliveryOutcome) {
        let write = self.store.record(item, outcome);
        if tokio::time::timeout(self.config.store_timeout, write).await.is_err() {
            tracing::warn!(
                item_id = %item.id,
                endpoint = %item.endpoint,
                "store record exceeded its timeout; continuing"
            );
        }
    }

    /// Close the queue, drain up to `deadline`, then cancel what remains and
    /// join every task.
    pub(crate) async fn shutdown(&self, deadline: Duration) -> DrainReport {
        let started = Instant::now();
        self.queue.close();

        let drain = async {
            loop {
                if self.queue.is_empty() && self.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let drained = tokio::time::timeout(deadline, drain).await.is_ok();
        let cancelled_in_flight = self.in_flight.load(Ordering::Acquire);
        let unfinished = self.queue.len();
        if !drained {
            tracing::warn!(
                unfinished,
                cancelled_in_flight,
                "drain deadline expired; cancelling outstanding work"
            );
        }
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.iter_mut().filter_map(Option::take).collect()
        };
        // Cancellation aborts in-flight sends at their next await, so joins
        // settle within roughly one attempt timeout.
        for handle in handles {
            if tokio::time::timeout(self.config.per_attempt_timeout, handle).await.is_err() {
                tracing::error!("worker failed to stop within the attempt timeout");
            }
        }
        let controller = self.controller.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(controller) = controller {
            let _ = controller.await;
        }
        self.metrics.set_active_workers(0);
        self.metrics.set_queue_sizes(self.queue.size_by_lane());

        let snap = self.metrics.snapshot();
        DrainReport {
            completed: snap.sends_success + snap.sends_failed + snap.sends_dropped,
            unfinished,
            cancelled_in_flight,
            elapsed: started.elapsed(),
        }
    }
}

async fn worker_loop(pool: Arc<WorkerPool>, id: usize) {
    loop {
        let tuning = *pool.tuning.get();
        // Scale-down boundary: indices outside the desired count exit here.
        if id >= tuning.workers {
            break;
        }
        let Some(batch) = pool.queue.dequeue_batch(tuning.batch_size, &pool.cancel).await else {
            break;
        };
        pool.metrics.batch_observed(batch.len(), id);
        pool.metrics.set_queue_sizes(pool.queue.size_by_lane());
        pool.deliver(batch, id).await;
    }
    pool.active_workers.fetch_sub(1, Ordering::AcqRel);
    pool.metrics.set_active_workers(pool.active_workers.load(Ordering::Acquire));
}

async fn controller_loop(pool: Arc<WorkerPool>, mut cpu_sampler: Box<dyn CpuSampler>) {
    let mut tuner = AdaptiveTuner::new(TunerConfig {
        min_batch: pool.config.min_batch,
        max_batch: pool.config.max_batch,
        min_workers: pool.config.min_workers,
        max_workers: pool.config.max_workers,
        target_cpu_percent: f64::from(pool.config.target_cpu_percent),
        drain_sla: pool.config.drain_sla,
    });
    let tick = pool.config.controller_tick;
    let mut previous = pool.metrics.snapshot();
    loop {
        tokio::select! {
            _ = pool.cancel.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }
        let snap = pool.metrics.snapshot();
        let completed_now = snap.sends_success + snap.sends_failed + snap.sends_dropped;
        let completed_before =
            previous.sends_success + previous.sends_failed + previous.sends_dropped;
        let sample = LoadSample {
            cpu_percent: cpu_sampler.sample(),
            items_completed: completed_now.saturating_sub(completed_before),
            items_failed: snap.sends_failed.saturating_sub(previous.sends_failed),
            window: tick,
            queue_depth: pool.queue.len(),
        };
        previous = snap;

        let current = *pool.tuning.get();
        let next = tuner.evaluate(current, &sample);
        if next != current {
            tracing::info!(
                batch_size = next.batch_size,
                workers = next.workers,
                cpu = sample.cpu_percent,
                queue_depth = sample.queue_depth,
                "tuning adjusted"
            );
        }
        pool.tuning.set(next);
        pool.metrics.set_batch_size(next.batch_size);
        pool.ensure_workers();
        pool.metrics.set_queue_sizes(pool.queue.size_by_lane());

        let evicted = pool.endpoints.evict_idle(pool.config.endpoint_idle_ttl);
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle endpoint state");
        }
    }
}
