//! Harness configuration.
//!
//! Every knob is an explicit value threaded into the server at build time
//! and handed to handlers through [`RequestContext::config`]. There is no
//! process-wide mutable state.
//!
//! Configuration can be built in code, through [`TestServerBuilder`]
//! setters, or loaded from JSON:
//!
//! ```
//! use request_lifetime::HarnessConfig;
//!
//! let config = HarnessConfig::from_json_str(r#"{ "response_buffer_limit": 1024 }"#).unwrap();
//! assert_eq!(config.response_buffer_limit, 1024);
//! assert_eq!(config.request_body_chunk_size, 16 * 1024);
//! ```
//!
//! [`RequestContext::config`]: crate::RequestContext::config
//! [`TestServerBuilder`]: crate::TestServerBuilder

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::DEFAULT_RESPONSE_BUFFER_LIMIT;
use crate::error::{HarnessError, Result};

/// Default request body chunk size.
pub const DEFAULT_REQUEST_BODY_CHUNK_SIZE: usize = 16 * 1024;

/// Default bound for driver-side waits, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Configuration for a test server and the requests it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Unread response bytes allowed before handler writes suspend (0 = unbounded).
    pub response_buffer_limit: usize,
    /// Size of the chunks the client splits a request body into.
    pub request_body_chunk_size: usize,
    /// Bound for driver-side waits, see [`HarnessConfig::default_timeout`].
    pub default_timeout_ms: u64,
    /// When set, a handler failure before the response started is reported
    /// in the body of the 500 response.
    pub debug_build: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            response_buffer_limit: DEFAULT_RESPONSE_BUFFER_LIMIT,
            request_body_chunk_size: DEFAULT_REQUEST_BODY_CHUNK_SIZE,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            debug_build: false,
        }
    }
}

impl HarnessConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.request_body_chunk_size == 0 {
            return Err(HarnessError::Config(
                "request_body_chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(HarnessError::Config(
                "default_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// [`default_timeout_ms`](Self::default_timeout_ms) as a `Duration`.
    #[inline]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
