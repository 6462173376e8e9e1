//! Route key derivation.
//!
//! A route key names the rate-limit bucket a request belongs to. Requests that
//! share a key are serialized through one handler; requests with different keys
//! never wait on each other.
//!
//! Bucketing follows the target API's documented rules:
//! - IDs directly under a *major parameter* (`channels`, `guilds`, `webhooks`) stay
//!   literal, because the API rate-limits each of those resources separately.
//! - Every other ID collapses to `:id`.
//! - Webhook tokens collapse to `:token`, reaction emoji to `:reaction`.
//! - Message deletion gets a dedicated bucket.
//!
//! ```rust
//! use http::Method;
//! use ratelane::route::route_key;
//!
//! let a = route_key(&Method::GET, "/channels/222197033908436994/messages/222197033908436995");
//! let b = route_key(&Method::PATCH, "/channels/222197033908436994/messages/381870553235193857");
//! assert_eq!(a, b);
//! assert_eq!(a.as_str(), "/channels/222197033908436994/messages/:id");
//! ```

use http::Method;
use std::fmt;

const MAJOR_PARAMETERS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// Canonical rate-limit bucket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey(String);

impl RouteKey {
    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RouteKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_snowflake(segment: &str) -> bool {
    (16..=20).contains(&segment.len()) && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Derive the route key for `method` + `path`.
///
/// Total and pure: any input yields a key, and equal inputs always yield equal keys.
/// Query strings and fragments never influence the bucket.
pub fn route_key(method: &Method, path: &str) -> RouteKey {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut normalized: Vec<&str> = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().copied().enumerate() {
        let prev = i.checked_sub(1).map(|j| segments[j]);
        let prev2 = i.checked_sub(2).map(|j| segments[j]);

        let bucketed = if prev == Some("reactions") {
            ":reaction"
        } else if prev2 == Some("webhooks") && prev.is_some_and(is_snowflake) {
            ":token"
        } else if is_snowflake(segment) {
            match prev {
                Some(p) if MAJOR_PARAMETERS.contains(&p) => segment,
                _ => ":id",
            }
        } else {
            segment
        };
        normalized.push(bucketed);
    }

    let mut key = String::with_capacity(path.len() + 8);
    for segment in &normalized {
        key.push('/');
        key.push_str(segment);
    }
    if key.is_empty() {
        key.push('/');
    }

    // Message deletion is limited on its own bucket, separate from edits/fetches.
    if *method == Method::DELETE
        && normalized.len() == 4
        && normalized[0] == "channels"
        && normalized[2] == "messages"
    {
        key.insert_str(0, "DELETE ");
    }

    RouteKey(key)
}
