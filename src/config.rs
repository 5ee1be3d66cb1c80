//! Service configuration
//!
//! Loaded from an optional YAML file. Every section falls back to its
//! defaults, so an empty file (or no file) is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::{DbConfig, RedisConfig};
use crate::cache::HotKeyPolicy;
use crate::error::{Error, Result};
use crate::session::ThrottlePolicy;
use crate::sync::WatermarkMode;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: HotKeyPolicy,
    pub sync: SyncConfig,
    pub session: SessionConfig,
    pub throttle: ThrottlePolicy,
    pub redis: RedisConfig,
    pub postgres: DbConfig,
    pub index: IndexConfig,
    pub server: ServerConfig,
}

/// Index-sync pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Producer timer period
    pub interval_secs: u64,
    /// Watermark width; must exceed the interval
    pub window_secs: u64,
    pub mode: WatermarkMode,
    pub queue: String,
    /// Number of consumer tasks
    pub consumers: usize,
    pub receive_wait_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            window_secs: 300,
            mode: WatermarkMode::Persisted,
            queue: "content_sync".to_string(),
            consumers: 1,
            receive_wait_ms: 1000,
            retry_backoff_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub token_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl SessionConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Search index location. `None` keeps the index in RAM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub health_addr: String,
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Read and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: AppConfig = if raw.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.throttle.validate()?;

        if self.sync.interval_secs == 0 {
            return Err(Error::Config("sync.interval_secs must be positive".to_string()));
        }
        // A window no wider than the timer period skips rows between cycles
        if self.sync.window_secs <= self.sync.interval_secs {
            return Err(Error::Config(format!(
                "sync.window_secs ({}) must exceed sync.interval_secs ({})",
                self.sync.window_secs, self.sync.interval_secs
            )));
        }
        if self.sync.consumers == 0 {
            return Err(Error::Config("sync.consumers must be at least 1".to_string()));
        }
        if self.sync.queue.is_empty() {
            return Err(Error::Config("sync.queue must not be empty".to_string()));
        }
        if self.session.token_ttl_secs == 0 {
            return Err(Error::Config("session.token_ttl_secs must be positive".to_string()));
        }

        for (name, addr) in [
            ("server.health_addr", &self.server.health_addr),
            ("server.metrics_addr", &self.server.metrics_addr),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|e| Error::Config(format!("{} '{}': {}", name, addr, e)))?;
        }

        Ok(())
    }
}
