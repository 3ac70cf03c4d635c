//! Delivery record sink.
//!
//! Recording is best-effort: the pool bounds each call with the configured
//! store timeout and logs-and-continues on failure, so a slow store can
//! never stall delivery.

use crate::item::{DeliveryOutcome, Item};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Persistent record of delivery outcomes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn record(&self, item: &Item, outcome: &DeliveryOutcome);
}

/// Store that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl Store for NullStore {
    async fn record(&self, _item: &Item, _outcome: &DeliveryOutcome) {}
}

/// In-memory store for tests and inspection.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<(String, DeliveryOutcome)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(item id, outcome)` pairs in record order.
    pub fn records(&self) -> Vec<(String, DeliveryOutcome)> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record(&self, item: &Item, outcome: &DeliveryOutcome) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((item.id.clone(), outcome.clone()));
    }
}
