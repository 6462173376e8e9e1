//! Convenient re-exports for common ratelane types.
pub use crate::{
    auth::{AuthSource, TokenAuth},
    config::DispatcherConfig,
    dispatcher::{Dispatcher, DispatcherBuilder},
    error::{ConfigError, DispatchError, TransportError},
    request::{ApiRequest, ApiResponse, Endpoint, PreparedRequest, RequestOptions},
    route::{route_key, RouteKey},
    strategy::{ExecutionStrategy, Outcome, RateLimitScope, Transport},
    telemetry::{DispatchEvent, MemorySink, TelemetrySink},
    ResponseFuture,
};
