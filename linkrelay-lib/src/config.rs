//! Gateway configuration, loadable from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [rate_limit]
//! max_requests = 30
//! window = "60s"
//!
//! [admission]
//! max_in_flight = 50
//! max_per_caller = 5
//!
//! [pool]
//! timeout = "30s"
//!
//! [forward]
//! retry_wait = "1s"
//!
//! [probe]
//! step_timeout = "10s"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{
    AdmissionConfig, ErrorKind, ForwardConfig, PoolConfig, ProbeConfig, RateLimitConfig, Result,
};

/// Configuration of all gateway components
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Per-caller rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Ceilings for concurrent forwards
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// The pooled HTTP client
    #[serde(default)]
    pub pool: PoolConfig,

    /// Redirects, retries and logging of a single forward
    #[serde(default)]
    pub forward: ForwardConfig,

    /// The connectivity prober
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl GatewayConfig {
    /// Load a configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// configuration. Unknown fields are rejected.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).map_err(|e| ErrorKind::ReadConfig(path.to_path_buf(), e))?;
        Self::parse(&contents)
    }

    /// Parse a configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not a valid configuration or a
    /// value is out of range
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.rate_limit.validate()?;
        Ok(config)
    }
}
