#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use crate::error::RouterError;

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Behavior flags for a [`Router`](crate::router::Router) instance.
///
/// Constructing a `RouterConfig` is in scope for this crate; loading one from
/// a file, environment, or remote config service is not.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// On error-driven reconnect, re-issue captured subscribes.
    pub restore_on_error_reconnect: bool,
    /// On clean disconnect/connect, re-issue subscribes.
    pub restore_on_normal_reconnect: bool,
    /// Allow duplicate subscribes to the same key as history-only.
    pub support_multiple_subscriptions: bool,
    /// Unsubscribe for an unknown subscription becomes an error ack rather
    /// than an info-level log line.
    pub non_exist_subscription_as_error: bool,
    lookup_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            restore_on_error_reconnect: false,
            restore_on_normal_reconnect: false,
            support_multiple_subscriptions: false,
            non_exist_subscription_as_error: false,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// Sets the timeout applied to all four lookup kinds (securities,
    /// portfolios, boards, time frames). Rejects negative durations — which
    /// cannot be represented by [`Duration`] — by rejecting anything that
    /// can't be built from a non-negative `f64` number of seconds, matching
    /// the source's `InvalidInterval` guard at setter time.
    pub fn with_lookup_timeout_secs(mut self, secs: f64) -> Result<Self, RouterError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(RouterError::invalid_interval("lookup_timeout"));
        }
        self.lookup_timeout = Duration::from_secs_f64(secs);
        Ok(self)
    }

    #[must_use]
    pub fn with_restore_on_error_reconnect(mut self, value: bool) -> Self {
        self.restore_on_error_reconnect = value;
        self
    }

    #[must_use]
    pub fn with_restore_on_normal_reconnect(mut self, value: bool) -> Self {
        self.restore_on_normal_reconnect = value;
        self
    }

    #[must_use]
    pub fn with_support_multiple_subscriptions(mut self, value: bool) -> Self {
        self.support_multiple_subscriptions = value;
        self
    }

    #[must_use]
    pub fn with_non_exist_subscription_as_error(mut self, value: bool) -> Self {
        self.non_exist_subscription_as_error = value;
        self
    }
}
