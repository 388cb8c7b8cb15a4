//! Engine configuration.
//!
//! ```json
//! {
//!   "default_ttl": "5m",
//!   "fetch_timeout_ms": 10000,
//!   "retry": { "max_retries": 5, "base_delay_ms": 100, "max_delay_ms": 10000, "multiplier": 2.0 }
//! }
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecordError, Result};
use crate::retry::RetryPolicy;
use crate::ttl::Ttl;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TTL used when a query does not name one.
    pub default_ttl: Ttl,
    pub retry: RetryPolicy,
    /// How long a promise-style call waits for the first snapshot.
    pub fetch_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: Ttl::default(),
            retry: RetryPolicy::default(),
            fetch_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RecordError::Config(e.to_string()))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
