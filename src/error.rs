//! Error types for dispatch, configuration, and transport.

use crate::route::RouteKey;
use http::StatusCode;
use std::time::Duration;

/// Errors a caller can observe on a dispatched request's future.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DispatchError {
    /// The request needed an `Authorization` header but no token is configured.
    #[error("no token configured for an authenticated request")]
    AuthMissing,
    /// The path was empty or did not start at the API root.
    #[error("invalid request path {path:?}: must be non-empty and start with '/'")]
    InvalidPath {
        /// The rejected path.
        path: String,
    },
    /// The route stayed rate limited for more consecutive attempts than allowed.
    #[error("route {route} still rate limited after {attempts} attempts (retry after {retry_after:?})")]
    RateLimited {
        /// Bucket that kept reporting a limit.
        route: RouteKey,
        /// Last cooldown the API asked for.
        retry_after: Duration,
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// The transport call failed or returned a non-success status.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// The dispatcher shut down (or the handler went away) before the request ran.
    #[error("request abandoned before completion")]
    Abandoned,
}

impl DispatchError {
    /// Check if this error is a missing-token failure.
    pub fn is_auth_missing(&self) -> bool {
        matches!(self, Self::AuthMissing)
    }

    /// Check if this error is rate-limit exhaustion.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Borrow the transport error if present.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures reported by a [`Transport`](crate::strategy::Transport) or classified from a response.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The API answered with a non-success, non-rate-limit status.
    #[error("unexpected status {status}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Raw response body, kept for callers that want the API's error payload.
        body: Vec<u8>,
    },
    /// The request never produced a response (DNS, TLS, reset, ...).
    #[error("connection: {0}")]
    Connection(String),
    /// The request could not be turned into a valid wire request.
    #[error("request could not be built: {0}")]
    Build(String),
}

impl TransportError {
    /// Status code for `Status` failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Connection(_) | Self::Build(_) => None,
        }
    }
}

/// Errors raised while building a [`Dispatcher`](crate::Dispatcher).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configured strategy name is not a built-in strategy.
    #[error("unknown execution strategy {name:?} (expected \"sequential\" or \"burst\")")]
    InvalidStrategy {
        /// The unresolved name.
        name: String,
    },
    /// A built-in strategy was selected without a transport to drive it.
    #[error("strategy {strategy:?} needs a transport; call DispatcherBuilder::transport")]
    MissingTransport {
        /// The selected built-in strategy.
        strategy: &'static str,
    },
    /// The API base URL could not be parsed or cannot carry a path.
    #[error("invalid API endpoint {url:?}: {reason}")]
    InvalidEndpoint {
        /// The rejected URL.
        url: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// API version zero is never valid.
    #[error("API version must be > 0")]
    InvalidVersion,
    /// `build` ran outside a tokio runtime and no runtime handle was supplied.
    #[error("no tokio runtime to run handlers on; build inside one or pass DispatcherBuilder::runtime")]
    RuntimeUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display_names_route_and_attempts() {
        let err = DispatchError::RateLimited {
            route: crate::route::route_key(&http::Method::GET, "/gateway"),
            retry_after: Duration::from_millis(1500),
            attempts: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains("/gateway"));
        assert!(msg.contains("6 attempts"));
        assert!(err.is_rate_limited());
        assert!(!err.is_auth_missing());
    }

    #[test]
    fn transport_errors_convert_and_expose_status() {
        let err: DispatchError = TransportError::Status {
            status: StatusCode::FORBIDDEN,
            body: b"{\"code\":50013}".to_vec(),
        }
        .into();
        assert_eq!(err.as_transport().and_then(TransportError::status), Some(StatusCode::FORBIDDEN));
        assert!(err.to_string().contains("403"));

        let conn = TransportError::Connection("reset by peer".into());
        assert_eq!(conn.status(), None);
    }

    #[test]
    fn invalid_strategy_lists_known_names() {
        let err = ConfigError::InvalidStrategy { name: "fastest".into() };
        let msg = err.to_string();
        assert!(msg.contains("fastest"));
        assert!(msg.contains("sequential"));
    }
}
