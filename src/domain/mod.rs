//! Domain Layer
//!
//! Core abstractions following Domain-Driven Design principles.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Value objects and trait abstractions for the
//!   primary store, fast cache, search index and message broker
//! - **Events** (`events.rs`) - Domain events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use qbank::domain::ports::{ContentStore, FastCache};
//!
//! async fn load<S, C>(store: &S, cache: &C, id: ItemId) -> Result<Option<ContentItem>>
//! where
//!     S: ContentStore,
//!     C: FastCache,
//! {
//!     // ...
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    AccountStore, ContentItem, ContentStore, Delivery, EventPublisher, FastCache, IndexDocument,
    ItemId, KeyTtl, MessageBroker, SearchIndex, SearchPage, SearchQuery, SortOrder, UserId,
    UserRole,
};
