use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ErrorKind, Result};

/// Default number of requests a caller may submit per window
const DEFAULT_MAX_REQUESTS: usize = 30;

/// Default length of the trailing window
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default interval between two sweeps over all windows
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-caller rate limiting configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum number of requests per caller inside one window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Length of the trailing window
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// How often stale windows are pruned and empty ones dropped
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

const fn default_max_requests() -> usize {
    DEFAULT_MAX_REQUESTS
}

const fn default_window() -> Duration {
    DEFAULT_WINDOW
}

const fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

impl RateLimitConfig {
    /// Check that the window and the sweep interval are not zero
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "rate_limit.window must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "rate_limit.sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
