//! Domain Events
//!
//! Immutable records of significant occurrences in the caching, index sync
//! and session subsystems.
//!
//! # Usage
//!
//! Domain events are used for:
//! - Audit logging (account suspensions, session revocations)
//! - Decoupling components from observability backends
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::account_suspended(user_id, 21);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::{ItemId, UserId};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Cache Events
    // =========================================================================
    /// A hot item missed the cache and its payload was written back.
    PayloadCached {
        item_id: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Index Sync Events
    // =========================================================================
    /// The producer published a batch of changed rows.
    SyncBatchPublished {
        items: usize,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// The consumer upserted a batch into the search index.
    SyncBatchIndexed {
        items: usize,
        dropped: usize,
        redelivered: bool,
        timestamp: DateTime<Utc>,
    },

    /// The consumer gave up on a batch.
    SyncBatchRejected {
        requeued: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Session Events
    // =========================================================================
    /// A device token was issued.
    SessionIssued {
        user_id: u64,
        device: String,
        timestamp: DateTime<Utc>,
    },

    /// A device token was deleted.
    SessionRevoked {
        user_id: u64,
        device: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// An account exceeded its request budget and was banned.
    AccountSuspended {
        user_id: u64,
        request_count: i64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Health Events
    // =========================================================================
    /// Component health changed.
    HealthChanged {
        component: String,
        healthy: bool,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn payload_cached(item_id: ItemId) -> Self {
        DomainEvent::PayloadCached {
            item_id: item_id.as_u64(),
            timestamp: Utc::now(),
        }
    }

    pub fn sync_batch_published(
        items: usize,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        DomainEvent::SyncBatchPublished {
            items,
            window_start,
            window_end,
            timestamp: Utc::now(),
        }
    }

    pub fn sync_batch_indexed(items: usize, dropped: usize, redelivered: bool) -> Self {
        DomainEvent::SyncBatchIndexed {
            items,
            dropped,
            redelivered,
            timestamp: Utc::now(),
        }
    }

    pub fn sync_batch_rejected(requeued: bool, reason: impl Into<String>) -> Self {
        DomainEvent::SyncBatchRejected {
            requeued,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn session_issued(user_id: UserId, device: &str) -> Self {
        DomainEvent::SessionIssued {
            user_id: user_id.as_u64(),
            device: device.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn session_revoked(user_id: UserId, device: &str, reason: impl Into<String>) -> Self {
        DomainEvent::SessionRevoked {
            user_id: user_id.as_u64(),
            device: device.to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn account_suspended(user_id: UserId, request_count: i64) -> Self {
        DomainEvent::AccountSuspended {
            user_id: user_id.as_u64(),
            request_count,
            timestamp: Utc::now(),
        }
    }

    pub fn health_changed(component: &str, healthy: bool, reason: Option<String>) -> Self {
        DomainEvent::HealthChanged {
            component: component.to_string(),
            healthy,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::PayloadCached { timestamp, .. } => *timestamp,
            DomainEvent::SyncBatchPublished { timestamp, .. } => *timestamp,
            DomainEvent::SyncBatchIndexed { timestamp, .. } => *timestamp,
            DomainEvent::SyncBatchRejected { timestamp, .. } => *timestamp,
            DomainEvent::SessionIssued { timestamp, .. } => *timestamp,
            DomainEvent::SessionRevoked { timestamp, .. } => *timestamp,
            DomainEvent::AccountSuspended { timestamp, .. } => *timestamp,
            DomainEvent::HealthChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::PayloadCached { .. } => "PayloadCached",
            DomainEvent::SyncBatchPublished { .. } => "SyncBatchPublished",
            DomainEvent::SyncBatchIndexed { .. } => "SyncBatchIndexed",
            DomainEvent::SyncBatchRejected { .. } => "SyncBatchRejected",
            DomainEvent::SessionIssued { .. } => "SessionIssued",
            DomainEvent::SessionRevoked { .. } => "SessionRevoked",
            DomainEvent::AccountSuspended { .. } => "AccountSuspended",
            DomainEvent::HealthChanged { .. } => "HealthChanged",
        }
    }

    /// Get the user ID if applicable.
    pub fn user_id(&self) -> Option<u64> {
        match self {
            DomainEvent::SessionIssued { user_id, .. } => Some(*user_id),
            DomainEvent::SessionRevoked { user_id, .. } => Some(*user_id),
            DomainEvent::AccountSuspended { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    /// Check if this is a security-relevant event worth auditing.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            DomainEvent::SessionRevoked { .. } | DomainEvent::AccountSuspended { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_user() {
        let event = DomainEvent::account_suspended(UserId::new(5), 21);
        assert_eq!(event.event_type(), "AccountSuspended");
        assert_eq!(event.user_id(), Some(5));
        assert!(event.is_security_event());

        let event = DomainEvent::sync_batch_indexed(3, 0, false);
        assert_eq!(event.user_id(), None);
        assert!(!event.is_security_event());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = DomainEvent::session_revoked(UserId::new(1), "pc", "logout");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SessionRevoked");
        assert_eq!(json["device"], "pc");

        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_type(), "SessionRevoked");
    }
}
