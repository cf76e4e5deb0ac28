//! Bounded waiting for eventually consistent state
//!
//! Callers outside the coordinator (test drivers, supervisor front ends) issue
//! a command and then need to observe its effect, which the platform may
//! reflect a little later. [`EventualConsistencyWaiter`] polls a predicate at
//! a fixed interval until it yields a value or the timeout elapses. It carries
//! no coordination logic; the coordinator never uses it internally.
//!
//! ```
//! use std::time::Duration;
//! use rvoip_call_monitor::consistency::EventualConsistencyWaiter;
//!
//! # async fn example() -> rvoip_call_monitor::Result<()> {
//! let waiter = EventualConsistencyWaiter::new(Duration::from_millis(10), Duration::from_millis(100));
//! let value = waiter.wait_for("answer", || Some(42)).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::WaiterConfig;
use crate::error::{MonitorError, Result};

/// Polls a predicate at `interval` for at most `timeout`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventualConsistencyWaiter {
    interval: Duration,
    timeout: Duration,
}

impl EventualConsistencyWaiter {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_config(config: &WaiterConfig) -> Self {
        Self::new(config.interval(), config.timeout())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll an async predicate until it returns `Some`
    ///
    /// The predicate is always evaluated at least once, and once more right at
    /// the deadline. `what` names the awaited condition in the timeout error.
    pub async fn wait_until<T, F, Fut>(&self, what: &str, mut predicate: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            if let Some(value) = predicate().await {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                let waited_ms = now.duration_since(started).as_millis() as u64;
                debug!("Gave up waiting for {} after {}ms", what, waited_ms);
                return Err(MonitorError::Timeout {
                    what: what.to_string(),
                    waited_ms,
                });
            }
            tokio::time::sleep_until(std::cmp::min(now + self.interval, deadline)).await;
        }
    }

    /// Poll a plain closure until it returns `Some`
    pub async fn wait_for<T, F>(&self, what: &str, mut predicate: F) -> Result<T>
    where
        F: FnMut() -> Option<T>,
    {
        self.wait_until(what, || std::future::ready(predicate())).await
    }
}

impl Default for EventualConsistencyWaiter {
    fn default() -> Self {
        Self::from_config(&WaiterConfig::default())
    }
}

/// One-shot form of [`EventualConsistencyWaiter::wait_until`] with millisecond bounds
pub async fn wait_until<T, F, Fut>(predicate: F, interval_ms: u64, timeout_ms: u64) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    EventualConsistencyWaiter::new(Duration::from_millis(interval_ms), Duration::from_millis(timeout_ms))
        .wait_until("condition", predicate)
        .await
}
