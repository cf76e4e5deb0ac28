//! Monitoring configuration
//!
//! All timeouts are stored in milliseconds and exposed as [`Duration`].
//!
//! ```
//! use rvoip_call_monitor::MonitorConfig;
//!
//! let config = MonitorConfig::default();
//! assert_eq!(config.takeover_grace_period().as_secs(), 10);
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Prefix of environment overrides, e.g. `RVOIP_MONITOR__PENDING_TIMEOUT_MS=5000`
pub const ENV_PREFIX: &str = "RVOIP_MONITOR";

/// Monitoring coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long the current owner has to answer a takeover request
    ///
    /// Silence for this long hands the call to the challenger.
    pub takeover_grace_period_ms: u64,

    /// How long a Pending session may hold a call awaiting platform confirmation
    pub pending_timeout_ms: u64,

    /// How long a resolved takeover request stays queryable before it is dropped
    pub resolved_takeover_retention_ms: u64,

    /// Keep new sessions Pending until `confirm_session`
    ///
    /// When false the store's acceptance makes a session Active immediately.
    pub require_platform_confirmation: bool,

    /// Capacity of the monitoring event feed
    pub event_buffer_size: usize,

    /// Defaults for callers waiting on eventual consistency
    pub waiter: WaiterConfig,
}

/// Polling defaults for [`EventualConsistencyWaiter`](crate::consistency::EventualConsistencyWaiter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            takeover_grace_period_ms: 10_000,
            pending_timeout_ms: 15_000,
            resolved_takeover_retention_ms: 60_000,
            require_platform_confirmation: false,
            event_buffer_size: 1000,
            waiter: WaiterConfig::default(),
        }
    }
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            timeout_ms: 5_000,
        }
    }
}

impl MonitorConfig {
    /// Load defaults, then an optional file, then `RVOIP_MONITOR__*` overrides
    ///
    /// The file format follows its extension (toml, yaml, json, ...). Nested
    /// keys use a double underscore: `RVOIP_MONITOR__WAITER__TIMEOUT_MS`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: MonitorConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the coordinator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.takeover_grace_period_ms == 0 {
            return Err(MonitorError::configuration("takeover_grace_period_ms must be greater than 0"));
        }
        if self.pending_timeout_ms == 0 {
            return Err(MonitorError::configuration("pending_timeout_ms must be greater than 0"));
        }
        if self.resolved_takeover_retention_ms == 0 {
            return Err(MonitorError::configuration("resolved_takeover_retention_ms must be greater than 0"));
        }
        if self.event_buffer_size == 0 {
            return Err(MonitorError::configuration("event_buffer_size must be greater than 0"));
        }
        if self.waiter.interval_ms == 0 {
            return Err(MonitorError::configuration("waiter.interval_ms must be greater than 0"));
        }
        if self.waiter.timeout_ms < self.waiter.interval_ms {
            return Err(MonitorError::configuration(format!(
                "waiter.timeout_ms ({}) must not be shorter than waiter.interval_ms ({})",
                self.waiter.timeout_ms, self.waiter.interval_ms
            )));
        }
        Ok(())
    }

    pub fn takeover_grace_period(&self) -> Duration {
        Duration::from_millis(self.takeover_grace_period_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn resolved_takeover_retention(&self) -> Duration {
        Duration::from_millis(self.resolved_takeover_retention_ms)
    }

    pub fn with_takeover_grace_period(mut self, grace: Duration) -> Self {
        self.takeover_grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_resolved_takeover_retention(mut self, retention: Duration) -> Self {
        self.resolved_takeover_retention_ms = retention.as_millis() as u64;
        self
    }

    pub fn with_platform_confirmation(mut self, required: bool) -> Self {
        self.require_platform_confirmation = required;
        self
    }
}

impl WaiterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
