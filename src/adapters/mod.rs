//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ContentStore │ AccountStore │ FastCache │ SearchIndex     │ │
//! │  │  MessageBroker │ EventPublisher                            │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ PostgresContentStore │ PostgresAccountStore               │ │
//! │  │ RedisFastCache │ RedisQueueBroker │ TantivySearchIndex    │ │
//! │  │ InMemory* │ LoggingEventPublisher                          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use qbank::adapters::{RedisConfig, RedisFastCache};
//! use qbank::domain::ports::FastCache;
//!
//! let cache = RedisFastCache::connect(&RedisConfig::default()).await?;
//! let hits = cache.incr("question:count:42").await?;
//! ```

pub mod event_publisher;
pub mod memory;
pub mod postgres;
pub mod redis;
pub mod redis_queue;
pub mod tantivy_index;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher, NoopEventPublisher};
pub use memory::{InMemoryAccountStore, InMemoryBroker, InMemoryContentStore, InMemoryFastCache};
pub use postgres::{DbConfig, PostgresAccountStore, PostgresContentStore};
pub use redis::{RedisConfig, RedisFastCache};
pub use redis_queue::RedisQueueBroker;
pub use tantivy_index::TantivySearchIndex;
