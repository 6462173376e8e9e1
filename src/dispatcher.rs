//! The dispatcher: single entry point for outbound requests.
//!
//! `dispatch` derives the route key, fetches or creates that route's handler under
//! the registry lock, releases the lock, and enqueues. The returned future settles
//! when the handler has run the request.
//!
//! ```rust,no_run
//! use http::Method;
//! use ratelane::{Dispatcher, DispatcherConfig, RequestOptions, TokenAuth};
//! # use ratelane::strategy::Transport;
//! # use std::sync::Arc;
//! # async fn example(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::builder()
//!     .config(DispatcherConfig { sweep_interval_secs: 60, ..Default::default() })
//!     .transport(transport)
//!     .auth(TokenAuth::application("my-token"))
//!     .build()?;
//!
//! let response = dispatcher
//!     .dispatch(Method::GET, "/channels/222197033908436994/messages", RequestOptions::new().query("limit", "10"))
//!     .await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

use crate::auth::{AuthSource, TokenAuth};
use crate::clock::{Clock, MonotonicClock};
use crate::config::DispatcherConfig;
use crate::error::{ConfigError, DispatchError};
use crate::global::GlobalRateLimit;
use crate::handler::{DispatchContext, PendingRequest, RequestHandler, ResponseFuture};
use crate::live::LiveValue;
use crate::registry::HandlerRegistry;
use crate::request::{ApiRequest, ApiResponse, RequestOptions};
use crate::route::RouteKey;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::strategy::{ExecutionStrategy, StrategySelector, Transport};
use crate::telemetry::{DispatchEvent, EventEmitter, NullSink, TelemetrySink};
use http::Method;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

/// Snapshot of one route's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteStatus {
    /// Requests waiting behind the one in flight.
    pub queued: usize,
    /// Whether a drain task is running.
    pub draining: bool,
}

#[derive(Debug)]
struct DispatcherInner {
    ctx: Arc<DispatchContext>,
    registry: HandlerRegistry<RequestHandler>,
    inactive_after: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherInner {
    fn handler_for(&self, route: &RouteKey) -> Arc<RequestHandler> {
        let (handler, created) = self
            .registry
            .get_or_create(route, || RequestHandler::new(route.clone(), Arc::clone(&self.ctx)));
        if created {
            debug!(target: "ratelane::dispatcher", route = %route, "created handler");
            self.ctx.events.emit(DispatchEvent::HandlerCreated { route: route.clone() });
        }
        handler
    }

    fn sweep(&self) -> Vec<RouteKey> {
        let now = self.ctx.clock.now_millis();
        let removed = self.registry.sweep(now, self.inactive_after);
        for (route, idle) in &removed {
            info!(
                target: "ratelane::registry",
                route = %route,
                idle_ms = idle.as_millis() as u64,
                "swept inactive handler"
            );
            self.ctx.events.emit(DispatchEvent::HandlerSwept { route: route.clone(), idle: *idle });
        }
        removed.into_iter().map(|(route, _)| route).collect()
    }

    fn stop_sweeper(&self) {
        if let Some(task) = self.sweeper.lock().expect("sweeper slot poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Routes requests to per-route handlers. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Queue a request on its route and return a future for the outcome.
    ///
    /// Returns immediately and may be called from any thread; the request runs on the
    /// runtime the dispatcher was built with.
    pub fn dispatch(
        &self,
        method: Method,
        path: impl Into<String>,
        options: RequestOptions,
    ) -> ResponseFuture {
        self.submit(ApiRequest::new(method, path, options))
    }

    /// Queue an already-built request.
    pub fn submit(&self, request: ApiRequest) -> ResponseFuture {
        if !request.has_valid_path() {
            return ResponseFuture::ready(Err(DispatchError::InvalidPath {
                path: request.path().to_string(),
            }));
        }
        if self.inner.ctx.is_closed() {
            return ResponseFuture::ready(Err(DispatchError::Abandoned));
        }

        let (mut pending, future) = PendingRequest::new(request);
        loop {
            let handler = self.inner.handler_for(pending.route());
            match handler.enqueue(pending) {
                Ok(()) => break,
                Err(refused) => {
                    debug!(
                        target: "ratelane::dispatcher",
                        route = %refused.route(),
                        "handler retired during dispatch; re-routing"
                    );
                    self.inner.registry.evict(refused.route(), &handler);
                    pending = refused;
                }
            }
        }
        // Lost a race with shutdown: the drain task abandons the request, and the
        // handler it landed on must not outlive the dispatcher.
        if self.inner.ctx.is_closed() {
            self.inner.registry.drain_all();
        }
        future
    }

    /// Current `Authorization` header value. Resolved fresh on every call.
    pub fn auth_header(&self) -> Result<String, DispatchError> {
        self.inner.ctx.auth_header()
    }

    /// Current API base URL.
    pub fn endpoint(&self) -> Url {
        self.inner.ctx.endpoint.load().api().clone()
    }

    /// Replace the API base URL for requests issued from now on.
    ///
    /// Requests already handed to the strategy keep the URL they were issued with.
    pub fn set_endpoint(&self, api: &str) -> Result<(), ConfigError> {
        let next = self.inner.ctx.endpoint.load().rebase(api)?;
        info!(target: "ratelane::dispatcher", endpoint = %next.api(), "endpoint replaced");
        self.inner.ctx.endpoint.store(next);
        Ok(())
    }

    /// Whether every route is currently paused by a global rate limit.
    pub fn is_globally_rate_limited(&self) -> bool {
        self.inner.ctx.global.is_limited()
    }

    /// Number of live handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Routes that currently have a handler, sorted.
    pub fn routes(&self) -> Vec<RouteKey> {
        self.inner.registry.routes()
    }

    /// Queue state for `route`, if it has a handler.
    pub fn route_status(&self, route: &RouteKey) -> Option<RouteStatus> {
        self.inner
            .registry
            .get(route)
            .map(|h| RouteStatus { queued: h.queued(), draining: h.is_draining() })
    }

    /// Run one sweep pass now; returns the routes whose handlers were removed.
    pub fn sweep_now(&self) -> Vec<RouteKey> {
        self.inner.sweep()
    }

    /// Stop sweeping, drop every handler and abandon queued requests.
    ///
    /// A request already handed to the strategy still completes. Everything queued
    /// behind it fails with `Abandoned` right away, including requests waiting out a
    /// cooldown, and so does every later dispatch.
    pub fn shutdown(&self) {
        self.inner.ctx.close();
        self.inner.stop_sweeper();
        let dropped = self.inner.registry.drain_all();
        info!(target: "ratelane::dispatcher", handlers = dropped.len(), "shut down");
    }
}

impl tower::Service<ApiRequest> for Dispatcher {
    type Response = ApiResponse;
    type Error = DispatchError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.inner.ctx.is_closed() {
            Poll::Ready(Err(DispatchError::Abandoned))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        self.submit(request)
    }
}

/// Builder for [`Dispatcher`]; `build` validates the configuration.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    strategy: Option<Arc<dyn ExecutionStrategy>>,
    transport: Option<Arc<dyn Transport>>,
    auth: Arc<dyn AuthSource>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: Option<EventEmitter>,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("strategy", &self.strategy.as_ref().map(|_| "<custom>"))
            .field("transport", &self.transport.as_ref().map(|_| "<transport>"))
            .field("auth", &"<auth>")
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            strategy: None,
            transport: None,
            auth: Arc::new(TokenAuth::empty()),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            events: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a caller-supplied strategy instead of the configured built-in.
    pub fn strategy(mut self, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Transport driven by the built-in strategies.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn auth<A: AuthSource + 'static>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper for cooldown and bucket waits, in handlers and the built-in strategies.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Runtime for drain and sweep tasks. Defaults to the runtime `build` is called on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Send dispatch events to `sink`.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.events = Some(EventEmitter::new(sink));
        self
    }

    /// Validate and build.
    ///
    /// Fails with `InvalidStrategy` for an unknown strategy name (unless a custom
    /// strategy was supplied), `MissingTransport` when a built-in strategy has no
    /// transport, and `InvalidEndpoint`/`InvalidVersion` for bad endpoint settings.
    /// Without [`runtime`](Self::runtime), fails with `RuntimeUnavailable` when called
    /// outside a tokio runtime.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        let endpoint = self.config.endpoint()?;
        let selector = match self.strategy {
            Some(custom) => StrategySelector::Custom(custom),
            None => StrategySelector::Named(self.config.strategy.clone()),
        };
        let strategy =
            selector.resolve(self.transport, &self.config.user_agent, Arc::clone(&self.sleeper))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ConfigError::RuntimeUnavailable)?,
        };

        let ctx = Arc::new(DispatchContext {
            strategy,
            auth: self.auth,
            token_prefix: self.config.token_prefix.clone(),
            endpoint: LiveValue::new(endpoint),
            global: GlobalRateLimit::new(Arc::clone(&self.clock)),
            clock: self.clock,
            sleeper: self.sleeper,
            events: self.events.unwrap_or_else(|| EventEmitter::new(NullSink)),
            max_rate_limit_retries: self.config.max_rate_limit_retries,
            runtime,
            closed: watch::channel(false).0,
        });

        let inner = Arc::new(DispatcherInner {
            ctx,
            registry: HandlerRegistry::default(),
            inactive_after: self.config.inactive_after(),
            sweeper: Mutex::new(None),
        });

        if let Some(interval) = self.config.sweep_interval() {
            let task = inner.ctx.runtime.spawn(run_sweeper(Arc::downgrade(&inner), interval));
            *inner.sweeper.lock().expect("sweeper slot poisoned") = Some(task);
        }

        debug!(
            target: "ratelane::dispatcher",
            sweep_interval_secs = self.config.sweep_interval_secs,
            strategy = %self.config.strategy,
            "dispatcher ready"
        );
        Ok(Dispatcher { inner })
    }
}

/// Periodic sweep. Holds only a weak reference, so dropping the last `Dispatcher`
/// ends the loop even if `Drop` never got to abort it.
async fn run_sweeper(inner: Weak<DispatcherInner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        if inner.ctx.is_closed() {
            break;
        }
        inner.sweep();
    }
}
