//! Convenience re-exports for the common path.
//!
//! ```
//! use feedrelay::prelude::*;
//! ```

pub use crate::{
    AdmissionResult, ContentKind, DeliveryOutcome, DrainReport, DropReason, ErrorKind, Item,
    Pipeline, PipelineBuilder, PipelineConfig, Priority, RejectReason, Snapshot,
};
pub use crate::{Fetcher, MetricsSink, Store, Transport};
