//! Live-updatable shared values.
//!
//! Readers take cheap snapshots through `ArcSwap`; writers replace the value
//! wholesale. Used for the API endpoint and for rotated auth tokens, where a
//! request must see either the old or the new value, never a torn one.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared value with lock-free snapshots and whole-value replacement.
#[derive(Debug)]
pub struct LiveValue<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for LiveValue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> LiveValue<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value. Later `store`s do not affect the snapshot.
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value; returns the previous one.
    pub fn store(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }
}

impl<T: Default> Default for LiveValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
