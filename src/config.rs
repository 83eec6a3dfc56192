use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;
use crate::interpreter::ResponseInterpreter;

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Envconfig, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum in-place retries after throttled responses. Unset retries forever.
    #[envconfig(from = "DISPATCH_MAX_THROTTLE_RETRIES")]
    #[validate(range(min = 1))]
    pub max_throttle_retries: Option<u32>,

    /// Names of the rate-limit headers to read from responses
    #[envconfig(nested = true)]
    #[validate(nested)]
    pub headers: HeaderNames,
}

/// Response headers consulted for rate-limit information. Lookup is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Envconfig, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HeaderNames {
    /// `true` when a 429 applies to all routes
    #[envconfig(from = "DISPATCH_HEADER_GLOBAL", default = "x-ratelimit-global")]
    #[validate(length(min = 1))]
    pub global: String,

    #[envconfig(from = "DISPATCH_HEADER_REMAINING", default = "x-ratelimit-remaining")]
    #[validate(length(min = 1))]
    pub remaining: String,

    /// Seconds until the bucket resets, relative to the response
    #[envconfig(from = "DISPATCH_HEADER_RESET", default = "x-ratelimit-reset")]
    #[validate(length(min = 1))]
    pub reset: String,

    /// Added by the upstream proxy. A 429 without it comes from the edge layer.
    #[envconfig(from = "DISPATCH_HEADER_VIA", default = "via")]
    #[validate(length(min = 1))]
    pub via: String,

    #[envconfig(from = "DISPATCH_HEADER_RETRY_AFTER", default = "retry-after")]
    #[validate(length(min = 1))]
    pub retry_after: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            global: "x-ratelimit-global".to_string(),
            remaining: "x-ratelimit-remaining".to_string(),
            reset: "x-ratelimit-reset".to_string(),
            via: "via".to_string(),
            retry_after: "retry-after".to_string(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_throttle_retries: None,
            headers: HeaderNames::default(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::init_from_env()?;
        config.validate_config()?;
        Ok(config)
    }

    /// Check value ranges and that every header name is a valid HTTP header name
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()?;
        ResponseInterpreter::try_from(&self.headers)?;
        Ok(())
    }
}
