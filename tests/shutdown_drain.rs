mod common;

use common::{item_to, wait_until, ScriptedTransport};
use feedrelay::{
    AdmissionResult, DeliveryOutcome, DropReason, MemoryStore, Pipeline, PipelineConfig, Priority,
    RejectReason,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HOOK: &str = "https://hooks.example.com/ingest";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_queued_work_within_the_sla() {
    let mut config = PipelineConfig::default();
    config.min_send_interval = Duration::ZERO;
    let transport = ScriptedTransport::new(vec![]);
    let store = MemoryStore::new();
    let pipeline = Pipeline::builder(config)
        .unwrap()
        .with_transport(transport.clone())
        .with_store(Arc::new(store.clone()))
        .build()
        .unwrap();

    for i in 0..20 {
        assert!(pipeline
            .enqueue(item_to(&format!("i-{i}"), HOOK, Priority::Normal))
            .is_admitted());
    }
    let report = pipeline.shutdown(Duration::from_secs(5)).await;

    assert_eq!(report.unfinished, 0);
    assert_eq!(report.cancelled_in_flight, 0);
    assert_eq!(report.completed, 20);
    assert!(report.elapsed < Duration::from_secs(5));
    assert_eq!(store.records().len(), 20);
    assert!(store.records().iter().all(|(_, outcome)| outcome.is_success()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_outstanding_work_after_the_deadline() {
    let mut config = PipelineConfig::default();
    config.min_workers = 1;
    config.max_workers = 1;
    config.min_send_interval = Duration::ZERO;
    // Bound the worker-join phase so the test observes the full stop within
    // drain deadline + attempt timeout.
    config.per_attempt_timeout = Duration::from_millis(500);
    let transport = ScriptedTransport::gated(vec![]);
    let store = MemoryStore::new();
    let pipeline = Pipeline::builder(config)
        .unwrap()
        .with_transport(transport.clone())
        .with_store(Arc::new(store.clone()))
        .build()
        .unwrap();

    for i in 0..3 {
        assert!(pipeline
            .enqueue(item_to(&format!("i-{i}"), HOOK, Priority::Normal))
            .is_admitted());
    }
    // The worker is wedged on the gated request.
    assert!(wait_until(|| transport.count() == 1, Duration::from_secs(2)).await);

    let started = Instant::now();
    let report = pipeline.shutdown(Duration::from_millis(100)).await;
    let stopped_in = started.elapsed();

    assert!(report.cancelled_in_flight > 0, "wedged work must be cancelled: {report:?}");
    assert!(
        stopped_in < Duration::from_secs(2),
        "shutdown must settle within drain deadline + attempt timeout, took {stopped_in:?}"
    );

    // Cancelled items surface as dropped outcomes, and admission is closed.
    assert!(
        wait_until(|| !store.records().is_empty(), Duration::from_secs(1)).await,
        "cancelled in-flight items are still recorded"
    );
    assert!(store.records().iter().any(|(_, outcome)| matches!(
        outcome,
        DeliveryOutcome::Dropped { reason: DropReason::ShuttingDown }
    )));
    assert_eq!(
        pipeline.enqueue(item_to("late", HOOK, Priority::High)),
        AdmissionResult::Rejected(RejectReason::ShuttingDown)
    );

    // Stats remain complete after shutdown.
    let snap = pipeline.stats();
    assert_eq!(snap.rejected.shutting_down, 1);
    assert_eq!(snap, pipeline.stats());
}
