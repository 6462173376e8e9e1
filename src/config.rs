//! Dispatcher configuration.
//!
//! Loading is the embedding application's job; this crate only reads the values.
//! With the `serde` feature the struct deserializes from any serde format, with every
//! field optional (missing fields take their defaults).

use crate::auth::DEFAULT_TOKEN_PREFIX;
use crate::error::ConfigError;
use crate::request::Endpoint;
use crate::strategy::StrategyKind;
use std::time::Duration;

/// Default API base URL.
pub const DEFAULT_API: &str = "https://discord.com/api";
/// Default API version.
pub const DEFAULT_VERSION: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DispatcherConfig {
    /// Seconds between sweeps of idle handlers; 0 disables sweeping.
    pub sweep_interval_secs: u64,
    /// Idle time after which a handler is reclaimable. Defaults to the sweep interval; never below 1s.
    pub inactive_after_secs: Option<u64>,
    /// API base URL.
    pub api: String,
    /// API version inserted as `/v{N}`.
    pub version: u8,
    /// Whether the version segment is used at all.
    pub versioned: bool,
    /// Prefix for application tokens in the `Authorization` header.
    pub token_prefix: String,
    /// Built-in strategy name: `sequential` or `burst`.
    pub strategy: String,
    pub user_agent: String,
    /// Consecutive rate-limit retries allowed per request before it is rejected.
    pub max_rate_limit_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            inactive_after_secs: None,
            api: DEFAULT_API.to_string(),
            version: DEFAULT_VERSION,
            versioned: true,
            token_prefix: DEFAULT_TOKEN_PREFIX.to_string(),
            strategy: StrategyKind::Sequential.name().to_string(),
            user_agent: concat!("ratelane/", env!("CARGO_PKG_VERSION")).to_string(),
            max_rate_limit_retries: 5,
        }
    }
}

impl DispatcherConfig {
    /// Sweep period, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn inactive_after(&self) -> Duration {
        Duration::from_secs(self.inactive_after_secs.unwrap_or(self.sweep_interval_secs).max(1))
    }

    /// Parse the endpoint settings.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Ok(Endpoint::parse(&self.api, self.version)?.with_versioning(self.versioned))
    }

    /// Check everything that can be checked without a transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        self.strategy.parse::<StrategyKind>()?;
        Ok(())
    }
}
