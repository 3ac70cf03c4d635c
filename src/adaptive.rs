//! Live-updatable shared values.
//!
//! The controller writes tuning rarely; every worker reads it on every loop
//! iteration. `ArcSwap` keeps the read path lock-free.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Cheap-to-read, controller-written cell.
#[derive(Debug)]
pub struct Adaptive<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Adaptive<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Adaptive<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.inner.load_full();
        self.inner.store(Arc::new(f(&current)));
    }
}
