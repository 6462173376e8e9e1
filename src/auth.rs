//! Auth context and `Authorization` header resolution.
//!
//! The dispatcher never stores the header itself: it asks an [`AuthSource`] on every
//! request, so a token rotated at runtime is picked up by the next issue.

use crate::error::DispatchError;
use crate::live::LiveValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default prefix for application (bot) tokens.
pub const DEFAULT_TOKEN_PREFIX: &str = "Bot";

/// Read-only view of the client's credentials.
pub trait AuthSource: Send + Sync + std::fmt::Debug {
    /// Current token, if any.
    fn token(&self) -> Option<String>;
    /// Whether the token belongs to a bot/application identity (and so needs a prefix).
    fn is_application(&self) -> bool;
}

/// Build the `Authorization` header value from `source`.
///
/// - token + application identity: `"{prefix} {token}"`
/// - token only: the bare token
/// - no token (or an empty one): [`DispatchError::AuthMissing`]
pub fn resolve_auth_header(source: &dyn AuthSource, prefix: &str) -> Result<String, DispatchError> {
    match source.token().filter(|t| !t.is_empty()) {
        Some(token) if source.is_application() => Ok(format!("{prefix} {token}")),
        Some(token) => Ok(token),
        None => Err(DispatchError::AuthMissing),
    }
}

/// In-memory credentials supporting runtime rotation.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    token: LiveValue<Option<String>>,
    application: Arc<AtomicBool>,
}

impl TokenAuth {
    /// No token configured yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Application (bot) token; sent with the configured prefix.
    pub fn application(token: impl Into<String>) -> Self {
        let auth = Self::default();
        auth.set_token(token);
        auth.application.store(true, Ordering::Release);
        auth
    }

    /// User/bearer token; sent bare.
    pub fn user(token: impl Into<String>) -> Self {
        let auth = Self::default();
        auth.set_token(token);
        auth
    }

    /// Rotate the token. Requests issued afterwards use the new value.
    pub fn set_token(&self, token: impl Into<String>) {
        self.token.store(Some(token.into()));
    }

    /// Forget the token; authenticated requests fail with `AuthMissing` until a new one is set.
    pub fn clear_token(&self) {
        self.token.store(None);
    }

    pub fn set_application(&self, application: bool) {
        self.application.store(application, Ordering::Release);
    }
}

impl AuthSource for TokenAuth {
    fn token(&self) -> Option<String> {
        (*self.token.load()).clone()
    }

    fn is_application(&self) -> bool {
        self.application.load(Ordering::Acquire)
    }
}
