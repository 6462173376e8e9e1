//! Process-wide rate-limit flag shared by every route handler.
//!
//! The flag is two atomics: a boolean that handlers read before each issue and a
//! cooldown deadline. Engaging uses `fetch_max` on the deadline, so concurrent
//! engagements keep the latest deadline and a set is never lost. Clearing races
//! are tolerated: at worst a handler resumes a moment early or late.

use crate::clock::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct GlobalRateLimit {
    limited: AtomicBool,
    until_millis: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl GlobalRateLimit {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { limited: AtomicBool::new(false), until_millis: AtomicU64::new(0), clock }
    }

    /// Pause every route for `retry_after` from now.
    pub fn engage(&self, retry_after: Duration) {
        let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        let until = self.clock.now_millis().saturating_add(millis);
        self.until_millis.fetch_max(until, Ordering::AcqRel);
        self.limited.store(true, Ordering::Release);
    }

    /// Whether requests are currently paused. Clears the flag once the cooldown has elapsed.
    pub fn is_limited(&self) -> bool {
        self.remaining().is_some()
    }

    /// Time left on the global cooldown, or `None` when requests may proceed.
    pub fn remaining(&self) -> Option<Duration> {
        if !self.limited.load(Ordering::Acquire) {
            return None;
        }
        let now = self.clock.now_millis();
        let until = self.until_millis.load(Ordering::Acquire);
        if now >= until {
            self.limited.store(false, Ordering::Release);
            // A concurrent engage may have moved the deadline after we read it.
            if self.until_millis.load(Ordering::Acquire) > now {
                self.limited.store(true, Ordering::Release);
                return self.remaining();
            }
            return None;
        }
        Some(Duration::from_millis(until - now))
    }

    /// Lift the pause immediately.
    pub fn clear(&self) {
        self.until_millis.store(0, Ordering::Release);
        self.limited.store(false, Ordering::Release);
    }
}
