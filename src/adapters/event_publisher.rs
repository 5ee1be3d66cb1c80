//! Event Publisher Adapters
//!
//! Audit sinks for domain events: the tracing log, an in-memory collector
//! for tests, and a no-op sink.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logging-based event publisher.
///
/// Publishes domain events to the tracing/logging system. Security events
/// (revocations, suspensions) are always logged at warn level.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log routine events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    /// Create a new logging event publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a publisher that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let user_id = event.user_id();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if event.is_security_event() {
            warn!(event_type = %event_type, user_id = ?user_id, event = %json, "Security event");
        } else if self.info_level {
            info!(event_type = %event_type, user_id = ?user_id, event = %json, "Domain event");
        } else {
            debug!(event_type = %event_type, event = %json, "Domain event");
        }

        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps every published event for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.event_type() == event_type)
    }

    /// Session and account events recorded for one user, oldest first.
    pub fn events_for_user(&self, user_id: u64) -> Vec<DomainEvent> {
        self.matching(|e| e.user_id() == Some(user_id))
    }

    /// Revocations and suspensions.
    pub fn security_events(&self) -> Vec<DomainEvent> {
        self.matching(DomainEvent::is_security_event)
    }

    fn matching(&self, predicate: impl Fn(&DomainEvent) -> bool) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Event publisher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: DomainEvent) -> Result<()> {
        Ok(())
    }

    async fn publish_all(&self, _events: Vec<DomainEvent>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ItemId, UserId};

    #[tokio::test]
    async fn test_logging_publisher() {
        let publisher = LoggingEventPublisher::new();
        let event = DomainEvent::session_issued(UserId::new(1), "pc");

        publisher.publish(event).await.unwrap();
        publisher
            .publish(DomainEvent::account_suspended(UserId::new(1), 21))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();

        assert!(collector.is_empty());

        collector
            .publish(DomainEvent::session_issued(UserId::new(1), "pc"))
            .await
            .unwrap();
        collector
            .publish(DomainEvent::session_issued(UserId::new(2), "mobile"))
            .await
            .unwrap();

        collector
            .publish(DomainEvent::session_revoked(UserId::new(2), "mobile", "logout"))
            .await
            .unwrap();
        collector
            .publish(DomainEvent::payload_cached(ItemId::new(9)))
            .await
            .unwrap();

        assert_eq!(collector.len(), 4);
        assert_eq!(collector.events_of_type("SessionIssued").len(), 2);
        assert!(collector.events_of_type("AccountSuspended").is_empty());
        assert_eq!(collector.events_for_user(2).len(), 2);
        assert_eq!(collector.security_events().len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }
}
