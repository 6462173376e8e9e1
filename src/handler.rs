//! Per-route request handlers.
//!
//! A handler owns the FIFO queue for one route and drains it on a single tokio task,
//! so requests on a route are issued strictly in order while different routes drain
//! in parallel.
//!
//! Lifecycle:
//! - `Idle`: no drain task. The first enqueue spawns one.
//! - `Draining`: the task pops the head request, waits out any global or route
//!   cooldown, invokes the execution strategy, and settles the request's future.
//!   When the queue is empty the task records `last_active` and exits.
//!
//! "Paused" is not a state: it is the cooldown wait before each issue.
//!
//! Handlers never decide on their own removal. The registry's sweep asks
//! [`RequestHandler::retire_if_inactive`] under the registry lock; once retired, a
//! handler refuses further enqueues and the dispatcher installs a fresh one.

use crate::auth::{resolve_auth_header, AuthSource};
use crate::clock::Clock;
use crate::error::DispatchError;
use crate::global::GlobalRateLimit;
use crate::live::LiveValue;
use crate::registry::Reclaimable;
use crate::request::{ApiRequest, ApiResponse, Endpoint};
use crate::route::RouteKey;
use crate::sleeper::Sleeper;
use crate::strategy::{ExecutionStrategy, Outcome, RateLimitScope};
use crate::telemetry::{DispatchEvent, EventEmitter};
use pin_project::pin_project;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// State shared by the dispatcher and every handler it creates.
#[derive(Debug)]
pub(crate) struct DispatchContext {
    pub(crate) strategy: Arc<dyn ExecutionStrategy>,
    pub(crate) auth: Arc<dyn AuthSource>,
    pub(crate) token_prefix: String,
    pub(crate) endpoint: LiveValue<Endpoint>,
    pub(crate) global: GlobalRateLimit,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) events: EventEmitter,
    pub(crate) max_rate_limit_retries: u32,
    /// Runtime the drain tasks run on, so `dispatch` works from any thread.
    pub(crate) runtime: Handle,
    /// Flips to `true` once on shutdown; cooldown waits watch it.
    pub(crate) closed: watch::Sender<bool>,
}

impl DispatchContext {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn auth_header(&self) -> Result<String, DispatchError> {
        resolve_auth_header(self.auth.as_ref(), &self.token_prefix)
    }
}

type Completion = oneshot::Sender<Result<ApiResponse, DispatchError>>;

/// A queued request and the sender half of its caller's future.
///
/// Settling consumes the value, so a request is fulfilled or rejected at most once.
/// Dropping it unsettled resolves the future with [`DispatchError::Abandoned`].
#[derive(Debug)]
pub(crate) struct PendingRequest {
    request: ApiRequest,
    completion: Completion,
}

impl PendingRequest {
    pub(crate) fn new(request: ApiRequest) -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { request, completion: tx }, ResponseFuture { state: State::Waiting(rx) })
    }

    pub(crate) fn route(&self) -> &RouteKey {
        self.request.route()
    }

    fn fulfill(self, response: ApiResponse) {
        // The caller may have dropped its future; nothing to do then.
        let _ = self.completion.send(Ok(response));
    }

    fn reject(self, error: DispatchError) {
        let _ = self.completion.send(Err(error));
    }
}

#[pin_project(project = StateProj)]
#[derive(Debug)]
enum State {
    Waiting(#[pin] oneshot::Receiver<Result<ApiResponse, DispatchError>>),
    Ready(Option<Result<ApiResponse, DispatchError>>),
}

/// Future returned by [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
///
/// Resolves once the route's handler has executed (or given up on) the request.
/// There is no cancellation: dropping the future leaves the request queued, and
/// its outcome is discarded.
#[pin_project]
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    #[pin]
    state: State,
}

impl ResponseFuture {
    pub(crate) fn ready(result: Result<ApiResponse, DispatchError>) -> Self {
        Self { state: State::Ready(Some(result)) }
    }
}

impl Future for ResponseFuture {
    type Output = Result<ApiResponse, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().state.project() {
            StateProj::Waiting(rx) => {
                rx.poll(cx).map(|received| received.unwrap_or(Err(DispatchError::Abandoned)))
            }
            StateProj::Ready(slot) => {
                Poll::Ready(slot.take().unwrap_or(Err(DispatchError::Abandoned)))
            }
        }
    }
}

#[derive(Debug)]
struct HandlerState {
    queue: VecDeque<PendingRequest>,
    draining: bool,
    retired: bool,
    last_active: u64,
}

/// Serialized execution queue for one route.
#[derive(Debug)]
pub(crate) struct RequestHandler {
    route: RouteKey,
    state: Mutex<HandlerState>,
    cooldown_until: AtomicU64,
    ctx: Arc<DispatchContext>,
}

impl RequestHandler {
    pub(crate) fn new(route: RouteKey, ctx: Arc<DispatchContext>) -> Self {
        let now = ctx.clock.now_millis();
        Self {
            route,
            state: Mutex::new(HandlerState {
                queue: VecDeque::new(),
                draining: false,
                retired: false,
                last_active: now,
            }),
            cooldown_until: AtomicU64::new(0),
            ctx,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().expect("request handler state poisoned")
    }

    /// Requests waiting behind the one in flight.
    pub(crate) fn queued(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.lock_state().draining
    }

    /// Append `pending` and start draining if idle.
    ///
    /// Returns the request back if this handler has been retired by a sweep; the
    /// caller must route it to a fresh handler.
    pub(crate) fn enqueue(self: &Arc<Self>, pending: PendingRequest) -> Result<(), PendingRequest> {
        let start = {
            let mut state = self.lock_state();
            if state.retired {
                return Err(pending);
            }
            state.queue.push_back(pending);
            state.last_active = self.ctx.clock.now_millis();
            !std::mem::replace(&mut state.draining, true)
        };

        if start {
            debug!(target: "ratelane::handler", route = %self.route, "draining");
            let handler = Arc::clone(self);
            self.ctx.runtime.spawn(async move { handler.drain().await });
        }
        Ok(())
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let pending = {
                let mut state = self.lock_state();
                if self.ctx.is_closed() {
                    let abandoned: Vec<PendingRequest> = state.queue.drain(..).collect();
                    state.draining = false;
                    drop(state);
                    if !abandoned.is_empty() {
                        debug!(
                            target: "ratelane::handler",
                            route = %self.route,
                            abandoned = abandoned.len(),
                            "dispatcher closed; abandoning queued requests"
                        );
                    }
                    return;
                }
                match state.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        state.draining = false;
                        state.last_active = self.ctx.clock.now_millis();
                        debug!(target: "ratelane::handler", route = %self.route, "idle");
                        return;
                    }
                }
            };
            self.process(pending).await;
        }
    }

    /// Run one request to completion, retrying in place on rate limits.
    async fn process(&self, pending: PendingRequest) {
        let started = self.ctx.clock.now_millis();
        let mut attempts: u32 = 0;

        loop {
            self.wait_for_capacity().await;
            if self.ctx.is_closed() {
                return;
            }

            let auth = if pending.request.options().auth {
                match self.ctx.auth_header() {
                    Ok(header) => Some(header),
                    Err(e) => return self.reject(pending, e),
                }
            } else {
                None
            };
            let endpoint = self.ctx.endpoint.load();

            attempts += 1;
            match self.ctx.strategy.execute(&pending.request, auth.as_deref(), &endpoint).await {
                Outcome::Success(response) => {
                    let elapsed = self.ctx.clock.now_millis().saturating_sub(started);
                    self.ctx.events.emit(DispatchEvent::RequestCompleted {
                        route: self.route.clone(),
                        status: response.status,
                        elapsed: Duration::from_millis(elapsed),
                    });
                    pending.fulfill(response);
                    return;
                }
                Outcome::RateLimited { scope, retry_after } => {
                    warn!(
                        target: "ratelane::handler",
                        route = %self.route,
                        %scope,
                        retry_after_ms = retry_after.as_millis() as u64,
                        attempt = attempts,
                        "rate limited"
                    );
                    self.ctx.events.emit(DispatchEvent::RateLimited {
                        route: self.route.clone(),
                        scope,
                        retry_after,
                    });
                    match scope {
                        RateLimitScope::Global => self.ctx.global.engage(retry_after),
                        RateLimitScope::Route => self.arm_cooldown(retry_after),
                    }
                    if attempts > self.ctx.max_rate_limit_retries {
                        let error = DispatchError::RateLimited {
                            route: self.route.clone(),
                            retry_after,
                            attempts,
                        };
                        return self.reject(pending, error);
                    }
                }
                Outcome::Failure(e) => return self.reject(pending, DispatchError::Transport(e)),
            }
        }
    }

    fn reject(&self, pending: PendingRequest, error: DispatchError) {
        debug!(target: "ratelane::handler", route = %self.route, error = %error, "request rejected");
        self.ctx.events.emit(DispatchEvent::RequestFailed {
            route: self.route.clone(),
            error: error.to_string(),
        });
        pending.reject(error);
    }

    /// Wait until neither the global flag nor this route's cooldown is active.
    /// Returns early on shutdown.
    async fn wait_for_capacity(&self) {
        let mut closed = self.ctx.closed.subscribe();
        loop {
            if self.ctx.is_closed() {
                return;
            }
            let Some(wait) = self.ctx.global.remaining().max(self.cooldown_remaining()) else {
                return;
            };
            tokio::select! {
                _ = self.ctx.sleeper.sleep(wait) => {}
                _ = closed.changed() => {}
            }
        }
    }

    fn arm_cooldown(&self, retry_after: Duration) {
        let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        let until = self.ctx.clock.now_millis().saturating_add(millis);
        self.cooldown_until.fetch_max(until, Ordering::AcqRel);
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.cooldown_until.load(Ordering::Acquire);
        let now = self.ctx.clock.now_millis();
        (until > now).then(|| Duration::from_millis(until - now))
    }
}

impl Reclaimable for RequestHandler {
    /// Inactive means: no drain task, empty queue, and idle for longer than `threshold`.
    /// Retires the handler in the same critical section, so no enqueue can slip in
    /// between the check and the removal.
    fn retire_if_inactive(&self, now_millis: u64, threshold: Duration) -> Option<Duration> {
        let threshold = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.lock_state();
        let idle = now_millis.saturating_sub(state.last_active);
        if state.draining || !state.queue.is_empty() || idle <= threshold {
            return None;
        }
        state.retired = true;
        Some(Duration::from_millis(idle))
    }

    fn retire(&self) {
        self.lock_state().retired = true;
    }
}
