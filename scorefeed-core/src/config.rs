//! Connection configuration for the notification pipeline.
//!
//! Connection strings are consumed as opaque values; nothing else in the
//! configuration affects core behavior.

use std::time::Duration;

/// Default interval between reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for a [`ConnectionManager`].
///
/// [`ConnectionManager`]: crate::manager::ConnectionManager
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// PostgreSQL connection string for the source-of-truth store.
    pub store_url: String,
    /// Redis connection string for the relay.
    pub relay_url: String,
    /// When true, consume change events via the relay and keep the direct
    /// store subscription as a fallback. When false, always subscribe
    /// directly to the store.
    pub prefer_relay: bool,
    /// Interval between reconnection attempts while degraded or while the
    /// preferred mode is unavailable.
    pub retry_interval: Duration,
}

impl NotifyConfig {
    /// Create a relay-preferring config with the default retry interval.
    pub fn new(store_url: impl Into<String>, relay_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            relay_url: relay_url.into(),
            prefer_relay: true,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_prefer_relay(mut self, prefer_relay: bool) -> Self {
        self.prefer_relay = prefer_relay;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}
