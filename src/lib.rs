//! Qbank Core - read-path caching, search sync and session abuse control
//!
//! The consistency-sensitive core of the question bank platform. Ordinary
//! CRUD and HTTP routing live elsewhere; this crate provides the components
//! they call into.
//!
//! # Architecture
//!
//! ```text
//!   read ──▶ HotKeyCache ──(cold / miss)──▶ ContentStore
//!                 │
//!                 └──(hot hit)──▶ FastCache
//!
//!   ContentStore ──▶ SyncProducer ──▶ MessageBroker ──▶ SyncConsumer ──▶ SearchIndex
//!
//!   request ──▶ AccessGuard ──▶ SessionRegistry + AbuseThrottle ──▶ business logic
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Hot-key cache-aside
//! - [`config`] - YAML service configuration
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus collectors
//! - [`server`] - Health and metrics endpoints
//! - [`session`] - Device tokens, request budget, sign-in calendar
//! - [`sync`] - Primary store to search index pipeline

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod server;
pub mod session;
pub mod sync;

// Re-export commonly used types
pub use cache::{HotKeyCache, HotKeyPolicy};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use session::{
    AccessGuard, Blacklist, Credentials, DeviceClass, SessionRegistry, SignInCalendar,
};
pub use sync::{SyncConsumer, SyncPipeline, SyncProducer, SyncWatermark};
