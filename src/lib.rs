#![forbid(unsafe_code)]

//! # feedrelay
//!
//! A priority-respecting delivery pipeline for feed items: a bounded,
//! deduplicating multi-priority queue feeds a pool of workers that deliver
//! each item to its HTTP webhook under per-endpoint rate limiting, bounded
//! retries with jittered exponential backoff, and per-endpoint circuit
//! breaking. A periodic controller re-tunes batch size and worker count
//! from observed load.
//!
//! ## Features
//!
//! - **Bounded priority queue** with O(1) dedup and a configurable overflow
//!   policy (displace or reject)
//! - **Rate-limited webhook sender** with a minimum send interval per
//!   endpoint, no burst allowance
//! - **Circuit breakers** per endpoint with half-open probe recovery
//! - **Adaptive worker pool** driven by CPU, throughput, and error-rate
//!   signals
//! - **Injectable clock and sleeper** for deterministic tests
//! - **Metrics sinks** as composable `tower` services
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use feedrelay::{
//!     ContentKind, Item, Pipeline, PipelineConfig, Priority,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder(PipelineConfig::default())?.build()?;
//!
//!     let item = Item::new(
//!         "item-1",
//!         "https://hooks.example.com/ingest",
//!         ContentKind::Article,
//!         Priority::High,
//!         serde_json::json!({ "title": "hello" }),
//!     );
//!     let admission = pipeline.enqueue(item);
//!     println!("admission: {admission:?}");
//!
//!     let report = pipeline.shutdown(Duration::from_secs(30)).await;
//!     println!("drained: {report:?}");
//!     Ok(())
//! }
//! ```

mod adaptive;
mod backoff;
mod breaker;
mod clock;
mod config;
mod endpoint;
mod error;
mod fetch;
mod item;
mod metrics;
mod pipeline;
mod pool;
mod queue;
mod rate_limit;
mod sender;
mod sleeper;
mod store;
mod trace;
mod transport;
mod tuner;

// Re-exports
pub use adaptive::Adaptive;
pub use backoff::{Backoff, Jitter};
pub use breaker::{BreakerConfig, BreakerDenied, BreakerPermit, BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, OverflowPolicy, PipelineConfig};
pub use endpoint::{canonical_key, EndpointRegistry, EndpointState};
pub use error::{exit_code, ErrorKind};
pub use fetch::{run_fetch_loop, FetchError, Fetcher};
pub use item::{
    AdmissionResult, ContentKind, DeliveryOutcome, DropReason, InvalidItem, Item, Priority,
    RejectReason,
};
pub use metrics::{
    boxed_sink, HistogramSnapshot, LogSink, MemorySink, MetricEvent, MetricValue, MetricsSink,
    NullSink, PipelineMetrics, RejectedCounts, SinkHandle, Snapshot,
};
pub use pipeline::{BuildError, Pipeline, PipelineBuilder};
pub use pool::DrainReport;
pub use queue::{Enqueued, PriorityQueue};
pub use rate_limit::{AcquireCancelled, MinIntervalLimiter};
pub use sender::{SenderConfig, WebhookSender};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{MemoryStore, NullStore, Store};
pub use trace::TraceContext;
pub use transport::{
    HttpTransport, Transport, TransportError, TransportResponse, WebhookRequest,
};
pub use tuner::{
    AdaptiveTuner, CpuSampler, Ema, FixedCpuSampler, LoadSample, SysinfoCpuSampler, Tuning,
    TunerConfig,
};

pub mod prelude;

/// Stable metric names exposed for scrape-side tooling.
pub use metrics::names as metric_names;
