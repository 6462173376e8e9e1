//! Request and response types passed between the dispatcher and execution strategies.

use crate::error::{ConfigError, TransportError};
use crate::route::{route_key, RouteKey};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::borrow::Cow;
use url::Url;

/// Header carrying the audit-log reason for moderation actions.
pub const AUDIT_LOG_REASON: HeaderName = HeaderName::from_static("x-audit-log-reason");

/// Free-form per-request configuration, passed through to the execution strategy.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Query pairs appended (percent-encoded) to the URL.
    pub query: Vec<(String, String)>,
    /// Extra headers; `Authorization` and `User-Agent` are set by the dispatcher.
    pub headers: HeaderMap,
    /// Pre-serialized body.
    pub body: Option<Vec<u8>>,
    /// Whether the request carries an `Authorization` header. Public endpoints set this to false.
    pub auth: bool,
    /// Audit-log reason.
    pub reason: Option<String>,
    /// Whether the API version segment (`/v{N}`) is inserted before the path.
    pub versioned: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            auth: true,
            reason: None,
            versioned: true,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Send without an `Authorization` header.
    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }

    /// Omit the API version segment.
    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }
}

/// A request queued on a route handler.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    route: RouteKey,
    options: RequestOptions,
}

impl ApiRequest {
    /// Build a request; the route key is derived here and never changes.
    pub fn new(method: Method, path: impl Into<String>, options: RequestOptions) -> Self {
        let path = path.into();
        let route = route_key(&method, &path);
        Self { method, path, route, options }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub(crate) fn has_valid_path(&self) -> bool {
        self.path.starts_with('/')
    }

    /// Assemble the wire-level request against `endpoint`.
    ///
    /// `auth` is the already-resolved `Authorization` value, if this request carries one.
    pub fn prepare(
        &self,
        endpoint: &Endpoint,
        auth: Option<&str>,
        user_agent: &str,
    ) -> Result<PreparedRequest, TransportError> {
        let mut headers = self.options.headers.clone();
        if let Ok(ua) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        if let Some(auth) = auth {
            let mut value = HeaderValue::from_str(auth)
                .map_err(|_| TransportError::Build("authorization token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(reason) = &self.options.reason {
            let encoded = utf8_percent_encode(reason, REASON_ENCODE_SET).to_string();
            let value = HeaderValue::from_str(&encoded)
                .map_err(|e| TransportError::Build(format!("audit log reason: {e}")))?;
            headers.insert(AUDIT_LOG_REASON, value);
        }

        Ok(PreparedRequest {
            method: self.method.clone(),
            url: endpoint.url_for(self),
            headers,
            body: self.options.body.clone(),
        })
    }
}

/// Characters left alone when encoding the audit-log reason, as a URI component.
const REASON_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// API base URL plus version, snapshotted per issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    api: Url,
    version: u8,
    versioned: bool,
}

impl Endpoint {
    /// Parse and validate an API base such as `https://discord.com/api`.
    pub fn parse(api: &str, version: u8) -> Result<Self, ConfigError> {
        if version == 0 {
            return Err(ConfigError::InvalidVersion);
        }
        let url = Url::parse(api)
            .map_err(|e| ConfigError::InvalidEndpoint { url: api.to_string(), reason: e.to_string() })?;
        if url.cannot_be_a_base() {
            return Err(ConfigError::InvalidEndpoint {
                url: api.to_string(),
                reason: "URL cannot carry a path".into(),
            });
        }
        Ok(Self { api: url, version, versioned: true })
    }

    /// Turn the `/v{N}` segment on or off for every request on this endpoint.
    pub fn with_versioning(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }

    /// Same version settings, different base URL.
    pub fn rebase(&self, api: &str) -> Result<Self, ConfigError> {
        Ok(Self::parse(api, self.version)?.with_versioning(self.versioned))
    }

    pub fn api(&self) -> &Url {
        &self.api
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Full URL for `request`: base, optional `/v{N}`, path, then query.
    pub fn url_for(&self, request: &ApiRequest) -> Url {
        let (path, raw_query) = match request.path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (request.path.as_str(), None),
        };

        let mut url = self.api.clone();
        let mut full = url.path().trim_end_matches('/').to_string();
        if self.versioned && request.options.versioned {
            full.push_str(&format!("/v{}", self.version));
        }
        full.push_str(path);
        url.set_path(&full);
        url.set_query(raw_query);
        if !request.options.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.options.query);
        }
        url
    }
}

/// Wire-ready request handed to a [`Transport`](crate::strategy::Transport).
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// Response returned to the caller of `dispatch`.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: Vec::new() }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    /// Body as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
