//! Registry of live route handlers.
//!
//! Maps route key → handler. Insert-or-fetch and sweep both run under one mutex,
//! and the critical section is map work only: no I/O, no awaiting. Lock order is
//! registry, then handler; handlers never call back into the registry.

use crate::route::RouteKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Something the registry can reclaim once it goes idle.
pub(crate) trait Reclaimable: Send + Sync {
    /// If inactive at `now_millis` (idle for longer than `threshold`), mark it retired
    /// and return how long it had been idle.
    fn retire_if_inactive(&self, now_millis: u64, threshold: Duration) -> Option<Duration>;

    /// Mark retired unconditionally.
    fn retire(&self);
}

#[derive(Debug)]
pub(crate) struct HandlerRegistry<H> {
    handlers: Mutex<HashMap<RouteKey, Arc<H>>>,
}

impl<H> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self { handlers: Mutex::new(HashMap::new()) }
    }
}

impl<H: Reclaimable> HandlerRegistry<H> {
    fn lock(&self) -> MutexGuard<'_, HashMap<RouteKey, Arc<H>>> {
        self.handlers.lock().expect("handler registry poisoned")
    }

    /// Fetch the handler for `route`, creating it with `create` if absent.
    ///
    /// Atomic: concurrent callers for a new route all receive the same instance, and
    /// `create` runs at most once. The flag is true for the caller that created it.
    pub(crate) fn get_or_create<F>(&self, route: &RouteKey, create: F) -> (Arc<H>, bool)
    where
        F: FnOnce() -> H,
    {
        let mut map = self.lock();
        if let Some(existing) = map.get(route) {
            return (Arc::clone(existing), false);
        }
        let handler = Arc::new(create());
        map.insert(route.clone(), Arc::clone(&handler));
        (handler, true)
    }

    pub(crate) fn get(&self, route: &RouteKey) -> Option<Arc<H>> {
        self.lock().get(route).cloned()
    }

    /// Remove every handler that is inactive at `now_millis`; returns what was removed.
    pub(crate) fn sweep(&self, now_millis: u64, threshold: Duration) -> Vec<(RouteKey, Duration)> {
        let mut removed = Vec::new();
        self.lock().retain(|route, handler| match handler.retire_if_inactive(now_millis, threshold) {
            Some(idle) => {
                removed.push((route.clone(), idle));
                false
            }
            None => true,
        });
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        removed
    }

    /// Drop `route`'s entry if it is still `handler`. Used when a retired handler is
    /// found mapped, so the next lookup creates a fresh one.
    pub(crate) fn evict(&self, route: &RouteKey, handler: &Arc<H>) -> bool {
        let mut map = self.lock();
        match map.get(route) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                map.remove(route);
                true
            }
            _ => false,
        }
    }

    /// Retire and remove every handler, busy or not. Returns the routes removed, sorted.
    pub(crate) fn drain_all(&self) -> Vec<RouteKey> {
        let mut routes: Vec<RouteKey> = self
            .lock()
            .drain()
            .map(|(route, handler)| {
                handler.retire();
                route
            })
            .collect();
        routes.sort();
        routes
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Routes with a live handler, sorted.
    pub(crate) fn routes(&self) -> Vec<RouteKey> {
        let mut routes: Vec<RouteKey> = self.lock().keys().cloned().collect();
        routes.sort();
        routes
    }
}
