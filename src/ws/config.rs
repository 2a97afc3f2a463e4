#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Constant;

const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_millis(2_000);
const DEFAULT_IDLE_TIMEOUT_DURATION: Duration = Duration::from_millis(90_000);

/// Configuration for the telemetry connection lifecycle.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed delay between a dropped connection and the next open attempt
    pub reconnect_interval: Duration,
    /// How long an open connection with no subscribers is kept before closing
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL_DURATION,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_DURATION,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_reconnect_interval(mut self, reconnect_interval: Duration) -> Self {
        self.reconnect_interval = reconnect_interval;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

// Reconnects never back off further: every attempt waits the same interval.
impl From<&Config> for Constant {
    fn from(config: &Config) -> Self {
        Constant::new(config.reconnect_interval)
    }
}
