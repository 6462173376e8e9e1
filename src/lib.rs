#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratelane
//!
//! Per-route request dispatch for rate-limited REST APIs.
//!
//! Every outbound request is keyed by the rate-limit bucket it falls into. Each key
//! gets its own FIFO handler, so one throttled route never stalls another, while a
//! global limit pauses them all.
//!
//! ## Features
//!
//! - **Route keys** that collapse IDs and tokens into their rate-limit bucket
//! - **Per-route handlers** created lazily and reclaimed by a periodic sweep
//! - **Global rate-limit flag** shared by every handler
//! - **Pluggable execution strategies** (`sequential`, `burst`, or your own)
//! - **Hot-swappable** API endpoint and token
//! - **Telemetry** through any `tower::Service<DispatchEvent>`
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use http::{Method, StatusCode};
//! use ratelane::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Loopback;
//!
//! #[async_trait]
//! impl Transport for Loopback {
//!     async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
//!         Ok(ApiResponse::new(StatusCode::OK).with_body(request.url.to_string()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .transport(Arc::new(Loopback))
//!         .auth(TokenAuth::application("token"))
//!         .build()?;
//!
//!     let response = dispatcher.dispatch(Method::GET, "/gateway", RequestOptions::new()).await?;
//!     assert_eq!(response.text(), "https://discord.com/api/v10/gateway");
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod global;
mod handler;
pub mod live;
pub mod prelude;
mod registry;
pub mod request;
pub mod route;
pub mod sleeper;
pub mod strategy;
pub mod telemetry;

// Re-exports
pub use auth::{resolve_auth_header, AuthSource, TokenAuth, DEFAULT_TOKEN_PREFIX};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder, RouteStatus};
pub use error::{ConfigError, DispatchError, TransportError};
pub use global::GlobalRateLimit;
pub use handler::ResponseFuture;
pub use live::LiveValue;
pub use request::{ApiRequest, ApiResponse, Endpoint, PreparedRequest, RequestOptions};
pub use route::{route_key, RouteKey};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use strategy::{
    BurstStrategy, ExecutionStrategy, Outcome, RateLimitScope, SequentialStrategy, StrategyKind,
    StrategySelector, Transport,
};
pub use telemetry::{DispatchEvent, LogSink, MemorySink, NullSink, TelemetrySink};
