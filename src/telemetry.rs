//! Dispatch telemetry.
//!
//! The dispatcher reports handler lifecycle and request outcomes as [`DispatchEvent`]s.
//! Events flow into any `tower::Service<DispatchEvent>` sink, so sinks compose with
//! standard tower combinators.
//!
//! Emission is best-effort: a sink that is not ready, or that fails, loses the event;
//! dispatch never waits on telemetry.
//!
//! ```rust
//! use ratelane::telemetry::{DispatchEvent, MemorySink};
//! use ratelane::route::route_key;
//! use http::Method;
//!
//! let sink = MemorySink::new();
//! let event = DispatchEvent::HandlerCreated { route: route_key(&Method::GET, "/gateway") };
//! assert_eq!(event.to_string(), "HandlerCreated(/gateway)");
//! assert!(sink.is_empty());
//! ```

use crate::route::RouteKey;
use crate::strategy::RateLimitScope;
use futures::FutureExt;
use http::StatusCode;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

/// Events emitted while dispatching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A handler was created for a route that had none.
    HandlerCreated { route: RouteKey },
    /// An idle handler was removed by a sweep pass.
    HandlerSwept { route: RouteKey, idle: Duration },
    /// The API reported a rate limit; the request will be retried after the cooldown.
    RateLimited { route: RouteKey, scope: RateLimitScope, retry_after: Duration },
    /// A request was fulfilled.
    RequestCompleted { route: RouteKey, status: StatusCode, elapsed: Duration },
    /// A request was rejected.
    RequestFailed { route: RouteKey, error: String },
}

impl DispatchEvent {
    pub fn route(&self) -> &RouteKey {
        match self {
            DispatchEvent::HandlerCreated { route }
            | DispatchEvent::HandlerSwept { route, .. }
            | DispatchEvent::RateLimited { route, .. }
            | DispatchEvent::RequestCompleted { route, .. }
            | DispatchEvent::RequestFailed { route, .. } => route,
        }
    }
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::HandlerCreated { route } => write!(f, "HandlerCreated({})", route),
            DispatchEvent::HandlerSwept { route, idle } => {
                write!(f, "HandlerSwept({}, idle={:?})", route, idle)
            }
            DispatchEvent::RateLimited { route, scope, retry_after } => {
                write!(f, "RateLimited({}, scope={}, retry_after={:?})", route, scope, retry_after)
            }
            DispatchEvent::RequestCompleted { route, status, elapsed } => {
                write!(f, "RequestCompleted({}, status={}, elapsed={:?})", route, status.as_u16(), elapsed)
            }
            DispatchEvent::RequestFailed { route, error } => {
                write!(f, "RequestFailed({}, error={})", route, error)
            }
        }
    }
}

/// A telemetry sink that consumes dispatch events.
pub trait TelemetrySink:
    Service<DispatchEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DispatchEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DispatchEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DispatchEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        tracing::info!(target: "ratelane::telemetry", event = %event, "dispatch_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory; oldest are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
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

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events matching `predicate`, in emission order.
    pub fn filter<F>(&self, predicate: F) -> Vec<DispatchEvent>
    where
        F: Fn(&DispatchEvent) -> bool,
    {
        self.events.lock().unwrap().iter().filter(|e| predicate(*e)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
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

impl Service<DispatchEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Type-erased sink shared by the dispatcher and all handlers.
pub(crate) struct EventEmitter {
    sink: Mutex<BoxCloneService<DispatchEvent, (), BoxError>>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").field("sink", &"<sink>").finish()
    }
}

impl EventEmitter {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let erased = BoxCloneService::new(sink.map_err(|e| Box::new(e) as BoxError));
        Self { sink: Mutex::new(erased) }
    }

    /// Best-effort, non-blocking emit. Sinks that are not immediately ready lose the event;
    /// sink futures that do not finish synchronously are driven on the current runtime.
    pub(crate) fn emit(&self, event: DispatchEvent) {
        let mut sink = self.sink.lock().expect("event sink poisoned").clone();
        let mut call = match sink.ready().now_or_never() {
            Some(Ok(ready)) => ready.call(event),
            _ => {
                tracing::trace!(target: "ratelane::telemetry", "sink not ready; event dropped");
                return;
            }
        };
        if (&mut call).now_or_never().is_none() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = call.await;
                });
            }
        }
    }
}
