#![allow(dead_code)]

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::{Method, StatusCode};
use ratelane::{ApiResponse, PreparedRequest, Transport, TransportError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One request as the mock transport saw it.
#[derive(Debug, Clone)]
pub struct Sent {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub authorization: Option<String>,
    pub at: Instant,
}

/// In-memory transport. Answers 200 with the request path as body unless a scripted
/// response is queued for that path. Paths are matched after `/api/v10`.
#[derive(Debug)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    script: Mutex<HashMap<String, VecDeque<Result<ApiResponse, TransportError>>>>,
    latency: Duration,
    started: Instant,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::default(),
            script: Mutex::default(),
            latency,
            started: Instant::now(),
        })
    }

    /// Queue `response` for the next request to `path`.
    pub fn script(&self, path: &str, response: Result<ApiResponse, TransportError>) {
        self.script.lock().unwrap().entry(path.to_string()).or_default().push_back(response);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, path: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.path == path).collect()
    }

    /// Time since the transport was created.
    pub fn offset(&self, sent: &Sent) -> Duration {
        sent.at.duration_since(self.started)
    }

    /// Yield until at least `n` requests went out.
    pub async fn wait_for(&self, n: usize) {
        while self.sent.lock().unwrap().len() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
        let path = request.url.path().trim_start_matches("/api/v10").to_string();
        self.sent.lock().unwrap().push(Sent {
            method: request.method.clone(),
            path: path.clone(),
            query: request.url.query().map(str::to_string),
            host: request.url.host_str().unwrap_or_default().to_string(),
            authorization: request
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            at: Instant::now(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self.script.lock().unwrap().get_mut(&path).and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(ApiResponse::new(StatusCode::OK).with_body(path)))
    }
}

pub fn too_many_requests(retry_after_secs: &str) -> ApiResponse {
    ApiResponse::new(StatusCode::TOO_MANY_REQUESTS).with_header("retry-after", retry_after_secs)
}

pub fn global_limit(retry_after_secs: &str) -> ApiResponse {
    too_many_requests(retry_after_secs).with_header("x-ratelimit-global", "true")
}

pub const CHANNEL_A: &str = "/channels/222197033908436994/messages";
pub const CHANNEL_B: &str = "/channels/381870553235193857/messages";
