//! Core configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default handshake completion window in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60;

/// Default initial reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;

/// Default reconnect delay cap in milliseconds.
pub const DEFAULT_RECONNECT_CAP_MS: u64 = 60_000;

/// Default number of reconnect attempts before a connection is reported failed.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default number of consecutive authentication failures that force a reconnect.
pub const DEFAULT_AUTH_FAILURE_THRESHOLD: u32 = 3;

/// Configuration for the connection manager and handshake driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreConfig {
    /// Seconds a handshake may take before the attempt is abandoned.
    pub handshake_timeout_secs: u64,

    /// Seconds between sealed keep-alive frames on an idle session.
    pub keepalive_interval_secs: u64,

    /// Initial reconnect backoff delay in milliseconds. Doubles per attempt.
    pub reconnect_initial_ms: u64,

    /// Upper bound on the reconnect backoff delay in milliseconds.
    pub reconnect_cap_ms: u64,

    /// Reconnect attempts after the initial one before the connection is
    /// reported failed instead of retried.
    pub max_reconnect_attempts: u32,

    /// Consecutive inbound authentication failures that tear the session
    /// down and force a reconnect.
    pub auth_failure_threshold: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_cap_ms: DEFAULT_RECONNECT_CAP_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            auth_failure_threshold: DEFAULT_AUTH_FAILURE_THRESHOLD,
        }
    }
}

impl CoreConfig {
    /// The handshake completion window.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// The keep-alive interval.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Base reconnect delay for the given attempt (1-based), exponential
    /// with a cap. Jitter is added by the caller.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self
            .reconnect_initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnect_cap_ms);
        Duration::from_millis(delay)
    }
}
