//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the core abstractions (ports) that the caching, index
//! sync and session components depend on. Infrastructure adapters implement
//! these traits to provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ContentStore │ AccountStore │ FastCache             │    │
//! │  │  SearchIndex  │ MessageBroker │ EventPublisher       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  Postgres │ Redis │ RedisQueue │ Tantivy │ InMemory  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Content item identifier (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl ItemId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// User account identifier (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Account role stored on the user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
    Ban,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
            UserRole::Ban => "ban",
        }
    }

    /// Parse the stored role column. Unknown values are treated as `User`.
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => UserRole::Admin,
            "ban" => UserRole::Ban,
            _ => UserRole::User,
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(self, UserRole::Ban)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative content row (a question) as held by the primary store.
///
/// The nullable text columns stay `Option` here; coalescing to empty strings
/// happens only when projecting into the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ItemId,
    pub user_id: UserId,
    pub title: Option<String>,
    pub content: Option<String>,
    /// JSON array of tag strings, as stored in the tags column
    pub tags: Option<String>,
    pub answer: Option<String>,
    pub edit_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub is_delete: bool,
}

impl ContentItem {
    /// Create a new live item with all timestamps set to `now`.
    pub fn new(id: impl Into<ItemId>, user_id: impl Into<UserId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: Some(title.into()),
            content: None,
            tags: None,
            answer: None,
            edit_time: now,
            create_time: now,
            update_time: now,
            is_delete: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    /// Set the tags column from a list of tags (stored as a JSON array).
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = serde_json::to_string(tags).ok();
        self
    }

    /// Set every timestamp to `at`.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.edit_time = at;
        self.create_time = at;
        self.update_time = at;
        self
    }

    /// Record a modification at `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.edit_time = at;
        self.update_time = at;
    }

    /// Soft-delete the item at `at`. The row stays visible to the sync scan.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.is_delete = true;
        self.update_time = at;
    }
}

// =============================================================================
// Primary Store Ports
// =============================================================================

/// Port for the authoritative content rows.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Load a live (not soft-deleted) item.
    async fn get_item(&self, id: ItemId) -> Result<Option<ContentItem>>;

    /// Insert or replace an item, keeping the timestamps it carries.
    async fn save_item(&self, item: &ContentItem) -> Result<()>;

    /// Soft-delete an item. Returns false if the item does not exist.
    async fn soft_delete(&self, id: ItemId, at: DateTime<Utc>) -> Result<bool>;

    /// Unscoped scan: every row, soft-deleted or not, with `update_time >= since`.
    async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<ContentItem>>;

    /// Check if the store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

/// Port for user account rows.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Current role of a user, `None` if the user does not exist.
    async fn get_role(&self, user_id: UserId) -> Result<Option<UserRole>>;

    /// Change a user's role. Returns false if the user does not exist.
    async fn set_role(&self, user_id: UserId, role: UserRole) -> Result<bool>;
}

// =============================================================================
// Fast Cache Port
// =============================================================================

/// Remaining lifetime of a fast cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    pub fn has_expiry(&self) -> bool {
        matches!(self, KeyTtl::Expires(_))
    }
}

/// Port for the low-latency key-value store.
///
/// Every method is a single indivisible operation against the shared store.
/// In particular `incr_with_expiry` must create the counter and set its
/// expiry in one atomic step.
#[async_trait]
pub trait FastCache: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set a string value, optionally with an expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically increment a counter, creating it at zero if absent.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically increment a counter and, when this increment created it,
    /// set its expiry in the same step.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Atomically set or clear one bit. Returns the previous bit value.
    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<bool>;

    /// Get one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Set one field of a hash and (re)set the expiry of the whole hash.
    async fn hset_with_expiry(&self, key: &str, field: &str, value: &str, ttl: Duration)
        -> Result<()>;

    /// Delete one field of a hash. Returns true if it existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Check if the cache is reachable.
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Search Index Port
// =============================================================================

/// Denormalized, queryable projection of a [`ContentItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub answer: String,
    pub user_id: u64,
    pub edit_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// 0 = live, 1 = soft-deleted
    pub is_delete: u8,
}

/// Result ordering for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Best match first
    #[default]
    Relevance,
    /// Most recently updated first
    UpdateTimeDesc,
    /// Most recently created first
    CreateTimeDesc,
}

/// Search request: should-match text plus filter clauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Full-text match over title, content and answer
    pub text: Option<String>,
    /// Every tag listed must be present
    pub tags: Vec<String>,
    /// Restrict to items created by this user
    pub user_id: Option<UserId>,
    /// Also return soft-deleted documents
    pub include_deleted: bool,
    pub sort: SortOrder,
    pub offset: usize,
    pub size: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            tags: Vec::new(),
            user_id: None,
            include_deleted: false,
            sort: SortOrder::Relevance,
            offset: 0,
            size: 10,
        }
    }
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchPage {
    /// Total number of matching documents, independent of pagination
    pub total: u64,
    pub hits: Vec<IndexDocument>,
}

/// Port for the full-text search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Idempotent upsert keyed by document ID. Either the whole batch is
    /// durably committed or an error is returned.
    async fn upsert(&self, documents: &[IndexDocument]) -> Result<()>;

    /// Fetch a single document by ID.
    async fn get(&self, id: u64) -> Result<Option<IndexDocument>>;

    /// Run a query.
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage>;
}

// =============================================================================
// Message Broker Port
// =============================================================================

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-local delivery tag used to ack/nack
    pub tag: u64,
    pub body: Bytes,
    /// True if this message was delivered before and not acknowledged
    pub redelivered: bool,
}

/// Port for the durable at-least-once queue.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish a message to a named queue.
    async fn publish(&self, queue: &str, body: Bytes) -> Result<()>;

    /// Wait up to `wait` for the next message.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a processed message.
    async fn ack(&self, queue: &str, delivery: &Delivery) -> Result<()>;

    /// Negatively acknowledge a message, optionally putting it back on the queue.
    async fn nack(&self, queue: &str, delivery: &Delivery, requeue: bool) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

use super::events::DomainEvent;

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
