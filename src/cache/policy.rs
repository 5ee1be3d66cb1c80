//! Hot-Key Policy
//!
//! Decides when an item counts as hot and how its cache keys are laid out.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::ItemId;
use crate::error::{Error, Result};

/// Hot-key classification and payload caching policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotKeyPolicy {
    /// An item is hot once its access count reaches this value
    pub hot_threshold: i64,
    /// Expiry of cached payloads in seconds. Payloads are never invalidated
    /// on write, so this bounds how stale a hot read can be.
    /// `None` is only accepted without write-back.
    pub payload_ttl_secs: Option<u64>,
    /// Write the loaded row back to the cache after a hot miss
    pub write_back_on_miss: bool,
    /// Key prefix of per-item access counters
    pub counter_prefix: String,
    /// Key prefix of cached payloads
    pub payload_prefix: String,
}

impl Default for HotKeyPolicy {
    fn default() -> Self {
        Self {
            hot_threshold: 1,
            payload_ttl_secs: Some(600),
            write_back_on_miss: true,
            counter_prefix: "question:count:".to_string(),
            payload_prefix: "question:cache:".to_string(),
        }
    }
}

impl HotKeyPolicy {
    /// Policy matching the legacy deployment: every read is hot but nothing
    /// is ever written back, so payloads only appear if put there externally.
    pub fn legacy() -> Self {
        Self {
            write_back_on_miss: false,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: i64) -> Self {
        self.hot_threshold = threshold;
        self
    }

    pub fn with_payload_ttl(mut self, ttl: Duration) -> Self {
        self.payload_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn counter_key(&self, id: ItemId) -> String {
        format!("{}{}", self.counter_prefix, id)
    }

    pub fn payload_key(&self, id: ItemId) -> String {
        format!("{}{}", self.payload_prefix, id)
    }

    pub fn payload_ttl(&self) -> Option<Duration> {
        self.payload_ttl_secs.map(Duration::from_secs)
    }

    /// Classify a post-increment access count.
    pub fn is_hot(&self, access_count: i64) -> bool {
        access_count >= self.hot_threshold
    }

    pub fn validate(&self) -> Result<()> {
        if self.counter_prefix == self.payload_prefix {
            return Err(Error::Config(
                "cache counter and payload prefixes must differ".to_string(),
            ));
        }
        if self.payload_ttl_secs == Some(0) {
            return Err(Error::Config("cache payload TTL must be positive".to_string()));
        }
        if self.write_back_on_miss && self.payload_ttl_secs.is_none() {
            return Err(Error::Config(
                "cache payload TTL is required when write-back is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
