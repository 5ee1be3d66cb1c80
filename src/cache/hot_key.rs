//! Hot-Key Cache-Aside
//!
//! Every read bumps the item's access counter. Once the counter reaches the
//! policy threshold the item is hot and its serialized payload is served from
//! the fast cache, bypassing the primary store.
//!
//! Fast cache failures never fail a read: they are logged and treated as a
//! miss.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::metrics::CacheMetrics;
use super::policy::HotKeyPolicy;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{ContentItem, ContentStore, EventPublisher, FastCache, ItemId};
use crate::error::Result;

/// Result of intercepting one read.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptOutcome {
    /// Item was classified hot on this read
    pub hot: bool,
    /// Post-increment access count, if the counter could be bumped
    pub access_count: Option<i64>,
    /// Payload served from the cache
    pub cached: Option<ContentItem>,
}

impl InterceptOutcome {
    fn cold(access_count: Option<i64>) -> Self {
        Self {
            hot: false,
            access_count,
            cached: None,
        }
    }

    pub fn served_from_cache(&self) -> bool {
        self.cached.is_some()
    }
}

/// Cache-aside front for content reads.
pub struct HotKeyCache {
    cache: Arc<dyn FastCache>,
    policy: HotKeyPolicy,
    metrics: Arc<CacheMetrics>,
    events: Arc<dyn EventPublisher>,
}

impl HotKeyCache {
    pub fn new(
        cache: Arc<dyn FastCache>,
        policy: HotKeyPolicy,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cache,
            policy,
            metrics: Arc::new(CacheMetrics::new()),
            events,
        }
    }

    pub fn policy(&self) -> &HotKeyPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Record an access and try to serve the item from the cache.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn intercept(&self, id: ItemId) -> InterceptOutcome {
        let access_count = match self.cache.incr(&self.policy.counter_key(id)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(item_id = %id, error = %e, "Access counter unavailable, treating read as cold");
                self.metrics.record_error();
                return InterceptOutcome::cold(None);
            }
        };

        if !self.policy.is_hot(access_count) {
            self.metrics.record_cold();
            return InterceptOutcome::cold(Some(access_count));
        }

        let cached = match self.cache.get(&self.policy.payload_key(id)).await {
            Ok(Some(raw)) => match serde_json::from_slice::<ContentItem>(&raw) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(item_id = %id, error = %e, "Dropping undecodable cached payload");
                    self.metrics.record_corrupt();
                    None
                }
            },
            Ok(None) => {
                self.metrics.record_miss();
                None
            }
            Err(e) => {
                warn!(item_id = %id, error = %e, "Payload lookup failed, falling through");
                self.metrics.record_error();
                None
            }
        };

        if cached.is_some() {
            debug!(item_id = %id, "Served from cache");
            self.metrics.record_hit();
        }

        InterceptOutcome {
            hot: true,
            access_count: Some(access_count),
            cached,
        }
    }

    /// Read an item through the cache, falling back to the primary store.
    ///
    /// Only primary store errors are returned. A hot miss is written back when
    /// the policy allows it.
    #[instrument(skip(self, store), fields(item_id = %id))]
    pub async fn read_through(
        &self,
        id: ItemId,
        store: &dyn ContentStore,
    ) -> Result<Option<ContentItem>> {
        let outcome = self.intercept(id).await;
        if let Some(item) = outcome.cached {
            return Ok(Some(item));
        }

        let item = store.get_item(id).await?;

        if outcome.hot && self.policy.write_back_on_miss {
            if let Some(item) = &item {
                self.write_back(item).await;
            }
        }

        Ok(item)
    }

    /// Store a payload snapshot. Returns false if the cache rejected it.
    pub async fn write_back(&self, item: &ContentItem) -> bool {
        let payload = match serde_json::to_vec(item) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Failed to serialize payload");
                return false;
            }
        };

        match self
            .cache
            .set(&self.policy.payload_key(item.id), payload, self.policy.payload_ttl())
            .await
        {
            Ok(()) => {
                self.metrics.record_write_back();
                let _ = self.events.publish(DomainEvent::payload_cached(item.id)).await;
                true
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Payload write-back failed");
                self.metrics.record_error();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::{InMemoryContentStore, InMemoryFastCache};

    fn setup(policy: HotKeyPolicy) -> (Arc<InMemoryFastCache>, HotKeyCache) {
        let cache = Arc::new(InMemoryFastCache::new());
        let hot = HotKeyCache::new(
            cache.clone(),
            policy,
            Arc::new(InMemoryEventCollector::new()),
        );
        (cache, hot)
    }

    #[tokio::test]
    async fn test_cold_read_does_not_touch_payload() {
        let (_cache, hot) = setup(HotKeyPolicy::default().with_threshold(3));

        let outcome = hot.intercept(ItemId::new(1)).await;
        assert!(!outcome.hot);
        assert_eq!(outcome.access_count, Some(1));
        assert!(!outcome.served_from_cache());
        assert_eq!(hot.metrics().snapshot().cold, 1);
    }

    #[tokio::test]
    async fn test_hot_miss_writes_back_then_hits() {
        let (_cache, hot) = setup(HotKeyPolicy::default());
        let store = InMemoryContentStore::with_items(vec![ContentItem::new(7u64, 1u64, "Lifetimes")]);

        let first = hot.read_through(ItemId::new(7), &store).await.unwrap().unwrap();
        assert_eq!(first.title.as_deref(), Some("Lifetimes"));
        assert_eq!(store.reads(), 1);

        let second = hot.read_through(ItemId::new(7), &store).await.unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(store.reads(), 1, "hot hit must bypass the store");

        let snap = hot.metrics().snapshot();
        assert_eq!(snap.write_backs, 1);
        assert_eq!(snap.hits, 1);
    }

    #[tokio::test]
    async fn test_written_back_payload_expires_and_reloads() {
        let policy = HotKeyPolicy::default().with_payload_ttl(std::time::Duration::from_secs(1));
        let (cache, hot) = setup(policy);
        let store = InMemoryContentStore::with_items(vec![ContentItem::new(9u64, 1u64, "Before")]);

        hot.read_through(ItemId::new(9), &store).await.unwrap();
        assert!(cache.ttl("question:cache:9").await.unwrap().has_expiry());

        let mut edited = store.get_item(ItemId::new(9)).await.unwrap().unwrap();
        edited.title = Some("After".to_string());
        store.save_item(&edited).await.unwrap();

        // Served stale until the payload expires
        let cached = hot.read_through(ItemId::new(9), &store).await.unwrap().unwrap();
        assert_eq!(cached.title.as_deref(), Some("Before"));

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let fresh = hot.read_through(ItemId::new(9), &store).await.unwrap().unwrap();
        assert_eq!(fresh.title.as_deref(), Some("After"));
    }

    #[tokio::test]
    async fn test_legacy_policy_never_writes_back() {
        let (_cache, hot) = setup(HotKeyPolicy::legacy());
        let store = InMemoryContentStore::with_items(vec![ContentItem::new(7u64, 1u64, "t")]);

        hot.read_through(ItemId::new(7), &store).await.unwrap();
        hot.read_through(ItemId::new(7), &store).await.unwrap();
        assert_eq!(store.reads(), 2);
        assert_eq!(hot.metrics().snapshot().write_backs, 0);
    }

    #[tokio::test]
    async fn test_corrupt_payload_falls_through() {
        let (cache, hot) = setup(HotKeyPolicy::default());
        let store = InMemoryContentStore::with_items(vec![ContentItem::new(3u64, 1u64, "real")]);
        cache
            .set("question:cache:3", Bytes::from_static(b"{not json"), None)
            .await
            .unwrap();

        let item = hot.read_through(ItemId::new(3), &store).await.unwrap().unwrap();
        assert_eq!(item.title.as_deref(), Some("real"));
        assert_eq!(hot.metrics().snapshot().corrupt, 1);

        // The write-back replaced the corrupt payload
        let outcome = hot.intercept(ItemId::new(3)).await;
        assert!(outcome.served_from_cache());
    }

    #[tokio::test]
    async fn test_cache_down_degrades_to_store() {
        let (cache, hot) = setup(HotKeyPolicy::default());
        let store = InMemoryContentStore::with_items(vec![ContentItem::new(5u64, 1u64, "t")]);
        cache.set_available(false);

        let item = hot.read_through(ItemId::new(5), &store).await.unwrap();
        assert!(item.is_some());
        assert_eq!(hot.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_missing_item_is_not_cached() {
        let (cache, hot) = setup(HotKeyPolicy::default());
        let store = InMemoryContentStore::new();

        assert!(hot.read_through(ItemId::new(404), &store).await.unwrap().is_none());
        assert!(cache.get("question:cache:404").await.unwrap().is_none());
    }
}
