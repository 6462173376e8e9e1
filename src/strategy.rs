//! Execution strategies: the boundary between the dispatcher and the wire.
//!
//! A handler hands each queued request to an [`ExecutionStrategy`] and acts on the
//! [`Outcome`]:
//! - `Success` fulfills the caller's future.
//! - `RateLimited` arms a route or global cooldown and retries the same request.
//! - `Failure` rejects the future and moves on to the next request.
//!
//! Two built-in strategies drive a caller-supplied [`Transport`]:
//! - `sequential` honors `x-ratelimit-remaining`/`x-ratelimit-reset-after` and waits out an
//!   exhausted bucket before returning, so the next request on the route is never early.
//! - `burst` issues immediately and relies on 429 responses alone.
//!
//! Anything else can be plugged in with [`StrategySelector::Custom`].

use crate::error::{ConfigError, TransportError};
use crate::request::{ApiRequest, ApiResponse, Endpoint, PreparedRequest};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Cooldown used when a 429 carries no usable timing headers.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Which cooldown a rate-limit response applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// Only the route that received the response.
    Route,
    /// Every route on the client.
    Global,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitScope::Route => f.write_str("route"),
            RateLimitScope::Global => f.write_str("global"),
        }
    }
}

/// Result of one strategy invocation.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(ApiResponse),
    RateLimited { scope: RateLimitScope, retry_after: Duration },
    Failure(TransportError),
}

/// Performs one request and interprets the API's rate-limit signals.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync + fmt::Debug {
    /// Execute `request` against `endpoint`.
    ///
    /// `auth` is the resolved `Authorization` value, or `None` for unauthenticated requests.
    async fn execute(&self, request: &ApiRequest, auth: Option<&str>, endpoint: &Endpoint) -> Outcome;
}

/// Sends a prepared request and returns the raw response.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError>;
}

/// Rate-limit headers as reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub global: bool,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_secs(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header_str(headers, "x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_after: header_str(headers, "x-ratelimit-reset-after").and_then(parse_secs),
            retry_after: header_str(headers, "retry-after").and_then(parse_secs),
            global: header_str(headers, "x-ratelimit-global")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }

    /// Time to wait before the bucket has capacity again, if it is exhausted now.
    pub fn exhausted_for(&self) -> Option<Duration> {
        match (self.remaining, self.reset_after) {
            (Some(0), Some(reset)) if !reset.is_zero() => Some(reset),
            _ => None,
        }
    }
}

/// Map a raw response onto an [`Outcome`].
pub fn classify(response: ApiResponse) -> Outcome {
    if response.status.is_success() {
        return Outcome::Success(response);
    }
    if response.status == StatusCode::TOO_MANY_REQUESTS {
        let limits = RateLimitHeaders::from_headers(&response.headers);
        let scope = if limits.global { RateLimitScope::Global } else { RateLimitScope::Route };
        let retry_after = limits.retry_after.or(limits.reset_after).unwrap_or(DEFAULT_RETRY_AFTER);
        return Outcome::RateLimited { scope, retry_after };
    }
    Outcome::Failure(TransportError::Status { status: response.status, body: response.body })
}

async fn issue(
    transport: &dyn Transport,
    request: &ApiRequest,
    auth: Option<&str>,
    endpoint: &Endpoint,
    user_agent: &str,
) -> Result<ApiResponse, TransportError> {
    let prepared = request.prepare(endpoint, auth, user_agent)?;
    transport.send(prepared).await
}

/// One request at a time, waiting out exhausted buckets before returning.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    user_agent: String,
}

impl SequentialStrategy {
    pub fn new(transport: Arc<dyn Transport>, user_agent: impl Into<String>) -> Self {
        Self { transport, sleeper: Arc::new(TokioSleeper), user_agent: user_agent.into() }
    }

    /// Swap the sleeper used for bucket waits (tests use `TrackingSleeper`).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    async fn execute(&self, request: &ApiRequest, auth: Option<&str>, endpoint: &Endpoint) -> Outcome {
        let response =
            match issue(self.transport.as_ref(), request, auth, endpoint, &self.user_agent).await {
                Ok(response) => response,
                Err(e) => return Outcome::Failure(e),
            };

        let limits = RateLimitHeaders::from_headers(&response.headers);
        let outcome = classify(response);
        if let (Outcome::Success(_), Some(wait)) = (&outcome, limits.exhausted_for()) {
            tracing::debug!(
                target: "ratelane::strategy",
                route = %request.route(),
                bucket_limit = limits.limit,
                wait_ms = wait.as_millis() as u64,
                "bucket exhausted; holding route until reset"
            );
            self.sleeper.sleep(wait).await;
        }
        outcome
    }
}

/// Fire immediately; only 429 responses slow the route down.
#[derive(Debug, Clone)]
pub struct BurstStrategy {
    transport: Arc<dyn Transport>,
    user_agent: String,
}

impl BurstStrategy {
    pub fn new(transport: Arc<dyn Transport>, user_agent: impl Into<String>) -> Self {
        Self { transport, user_agent: user_agent.into() }
    }
}

#[async_trait]
impl ExecutionStrategy for BurstStrategy {
    async fn execute(&self, request: &ApiRequest, auth: Option<&str>, endpoint: &Endpoint) -> Outcome {
        match issue(self.transport.as_ref(), request, auth, endpoint, &self.user_agent).await {
            Ok(response) => classify(response),
            Err(e) => Outcome::Failure(e),
        }
    }
}

/// Built-in strategy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Sequential,
    Burst,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Sequential => "sequential",
            StrategyKind::Burst => "burst",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(StrategyKind::Sequential),
            "burst" => Ok(StrategyKind::Burst),
            _ => Err(ConfigError::InvalidStrategy { name: s.to_string() }),
        }
    }
}

/// Strategy choice: a built-in by name, or a caller-supplied implementation.
#[derive(Clone)]
pub enum StrategySelector {
    Named(String),
    Custom(Arc<dyn ExecutionStrategy>),
}

impl fmt::Debug for StrategySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategySelector::Named(name) => f.debug_tuple("Named").field(name).finish(),
            StrategySelector::Custom(_) => f.write_str("Custom(<strategy>)"),
        }
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        StrategySelector::Named(StrategyKind::Sequential.name().to_string())
    }
}

impl StrategySelector {
    /// Resolve to a concrete strategy. Unknown names fail here, at configuration time.
    ///
    /// `sleeper` drives the `sequential` strategy's bucket waits.
    pub fn resolve(
        &self,
        transport: Option<Arc<dyn Transport>>,
        user_agent: &str,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Arc<dyn ExecutionStrategy>, ConfigError> {
        let kind = match self {
            StrategySelector::Custom(strategy) => return Ok(strategy.clone()),
            StrategySelector::Named(name) => name.parse::<StrategyKind>()?,
        };
        let transport = transport.ok_or(ConfigError::MissingTransport { strategy: kind.name() })?;
        Ok(match kind {
            StrategyKind::Sequential => {
                Arc::new(SequentialStrategy::new(transport, user_agent).with_sleeper(sleeper))
            }
            StrategyKind::Burst => Arc::new(BurstStrategy::new(transport, user_agent)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestOptions;
    use crate::sleeper::TrackingSleeper;
    use http::Method;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<ApiResponse, TransportError>>>,
        seen: Mutex<Vec<PreparedRequest>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<ApiResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(responses), seen: Mutex::default() })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn request() -> ApiRequest {
        ApiRequest::new(Method::GET, "/channels/222197033908436994", RequestOptions::new())
    }

    fn endpoint() -> Endpoint {
        Endpoint::parse("https://discord.com/api", 10).unwrap()
    }

    #[test]
    fn classify_maps_statuses() {
        assert!(matches!(classify(ApiResponse::new(StatusCode::OK)), Outcome::Success(_)));
        assert!(matches!(classify(ApiResponse::new(StatusCode::NO_CONTENT)), Outcome::Success(_)));

        let route_429 = ApiResponse::new(StatusCode::TOO_MANY_REQUESTS).with_header("retry-after", "2.5");
        match classify(route_429) {
            Outcome::RateLimited { scope, retry_after } => {
                assert_eq!(scope, RateLimitScope::Route);
                assert_eq!(retry_after, Duration::from_millis(2500));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        let global_429 = ApiResponse::new(StatusCode::TOO_MANY_REQUESTS)
            .with_header("x-ratelimit-global", "true")
            .with_header("x-ratelimit-reset-after", "4");
        match classify(global_429) {
            Outcome::RateLimited { scope, retry_after } => {
                assert_eq!(scope, RateLimitScope::Global);
                assert_eq!(retry_after, Duration::from_secs(4));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        match classify(ApiResponse::new(StatusCode::TOO_MANY_REQUESTS)) {
            Outcome::RateLimited { retry_after, .. } => assert_eq!(retry_after, DEFAULT_RETRY_AFTER),
            other => panic!("expected rate limit, got {other:?}"),
        }

        let forbidden = ApiResponse::new(StatusCode::FORBIDDEN).with_body("missing access");
        match classify(forbidden) {
            Outcome::Failure(TransportError::Status { status, body }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, b"missing access");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn header_parsing_ignores_garbage() {
        let response = ApiResponse::new(StatusCode::OK)
            .with_header("x-ratelimit-limit", "5")
            .with_header("x-ratelimit-remaining", "oops")
            .with_header("x-ratelimit-reset-after", "-1");
        let limits = RateLimitHeaders::from_headers(&response.headers);
        assert_eq!(limits.limit, Some(5));
        assert_eq!(limits.remaining, None);
        assert_eq!(limits.reset_after, None);
        assert!(!limits.global);
        assert_eq!(limits.exhausted_for(), None);
    }

    #[tokio::test]
    async fn sequential_waits_out_an_exhausted_bucket() {
        let transport = ScriptedTransport::new(vec![Ok(ApiResponse::new(StatusCode::OK)
            .with_header("x-ratelimit-remaining", "0")
            .with_header("x-ratelimit-reset-after", "1.25"))]);
        let sleeper = TrackingSleeper::new();
        let strategy =
            SequentialStrategy::new(transport.clone(), "ua").with_sleeper(Arc::new(sleeper.clone()));

        let outcome = strategy.execute(&request(), Some("Bot abc"), &endpoint()).await;

        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(1250)]);
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url.as_str(), "https://discord.com/api/v10/channels/222197033908436994");
    }

    #[tokio::test]
    async fn burst_never_waits_and_reports_connection_failures() {
        let transport = ScriptedTransport::new(vec![
            Ok(ApiResponse::new(StatusCode::OK)
                .with_header("x-ratelimit-remaining", "0")
                .with_header("x-ratelimit-reset-after", "10")),
            Err(TransportError::Connection("reset".into())),
        ]);
        let strategy = BurstStrategy::new(transport, "ua");

        let first = tokio::time::timeout(
            Duration::from_millis(500),
            strategy.execute(&request(), None, &endpoint()),
        )
        .await
        .expect("burst must not wait on exhausted buckets");
        assert!(matches!(first, Outcome::Success(_)));

        let second = strategy.execute(&request(), None, &endpoint()).await;
        assert!(matches!(second, Outcome::Failure(TransportError::Connection(_))));
    }

    #[derive(Debug)]
    struct Canned;

    #[async_trait]
    impl ExecutionStrategy for Canned {
        async fn execute(&self, _: &ApiRequest, _: Option<&str>, _: &Endpoint) -> Outcome {
            Outcome::Success(ApiResponse::new(StatusCode::ACCEPTED))
        }
    }

    #[test]
    fn selector_resolution() {
        let transport: Arc<dyn Transport> = ScriptedTransport::new(vec![]);
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

        let resolve = |selector: StrategySelector, transport: Option<Arc<dyn Transport>>| {
            selector.resolve(transport, "ua", sleeper.clone())
        };

        assert!(resolve(StrategySelector::default(), Some(transport.clone())).is_ok());
        assert!(resolve(StrategySelector::Named("BURST".into()), Some(transport.clone())).is_ok());
        assert_eq!(
            resolve(StrategySelector::Named("bogus".into()), Some(transport)).unwrap_err(),
            ConfigError::InvalidStrategy { name: "bogus".into() }
        );
        assert_eq!(
            resolve(StrategySelector::default(), None).unwrap_err(),
            ConfigError::MissingTransport { strategy: "sequential" }
        );
        // Custom strategies need no transport.
        assert!(resolve(StrategySelector::Custom(Arc::new(Canned)), None).is_ok());
    }
}
