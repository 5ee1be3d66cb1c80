//! In-Memory Adapters
//!
//! Process-local implementations of every port. They keep the same atomicity
//! guarantees as the networked adapters (each operation runs under a single
//! shard or map lock) and are used for tests and single-process runs.
//!
//! Each adapter can be switched to an "unavailable" state to exercise the
//! degrade / fail-closed paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::domain::ports::{
    AccountStore, ContentItem, ContentStore, Delivery, FastCache, ItemId, KeyTtl, MessageBroker,
    UserId, UserRole,
};
use crate::error::{Error, Result};

// =============================================================================
// Fast Cache
// =============================================================================

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

fn wrong_type(key: &str) -> Error {
    Error::CacheUnavailable(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

fn parse_counter(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::CacheUnavailable(format!("value at '{}' is not an integer", key))
        })
}

/// Redis-like fast cache backed by a sharded map.
#[derive(Debug)]
pub struct InMemoryFastCache {
    entries: DashMap<String, Slot>,
    available: AtomicBool,
}

impl Default for InMemoryFastCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFastCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the cache going down (every call fails) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CacheUnavailable("connection refused".to_string()))
        }
    }

    fn purge_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, slot| slot.is_expired());
    }

    fn increment(&self, key: &str, ttl_if_created: Option<Duration>) -> Result<i64> {
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Str(b"0".to_vec())));

        if slot.is_expired() {
            *slot = Slot::new(Value::Str(b"0".to_vec()));
        }

        let next = match &slot.value {
            Value::Str(raw) => parse_counter(key, raw)? + 1,
            Value::Hash(_) => return Err(wrong_type(key)),
        };
        slot.value = Value::Str(next.to_string().into_bytes());

        if next == 1 {
            if let Some(ttl) = ttl_if_created {
                slot.expires_at = Some(Instant::now() + ttl);
            }
        }

        Ok(next)
    }
}

#[async_trait]
impl FastCache for InMemoryFastCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_available()?;
        self.purge_expired(key);

        match self.entries.get(key) {
            Some(slot) => match &slot.value {
                Value::Str(raw) => Ok(Some(Bytes::copy_from_slice(raw))),
                Value::Hash(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.ensure_available()?;
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_vec()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        self.purge_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.ensure_available()?;
        self.increment(key, None)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.ensure_available()?;
        self.increment(key, Some(ttl))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.ensure_available()?;
        self.purge_expired(key);

        Ok(match self.entries.get(key) {
            None => KeyTtl::Missing,
            Some(slot) => match slot.expires_at {
                None => KeyTtl::Persistent,
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
            },
        })
    }

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<bool> {
        self.ensure_available()?;

        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Str(Vec::new())));

        if slot.is_expired() {
            *slot = Slot::new(Value::Str(Vec::new()));
        }

        let raw = match &mut slot.value {
            Value::Str(raw) => raw,
            Value::Hash(_) => return Err(wrong_type(key)),
        };

        let byte = (offset / 8) as usize;
        let mask = 1u8 << (7 - (offset % 8) as u8);
        if raw.len() <= byte {
            raw.resize(byte + 1, 0);
        }

        let previous = raw[byte] & mask != 0;
        if value {
            raw[byte] |= mask;
        } else {
            raw[byte] &= !mask;
        }

        Ok(previous)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        self.purge_expired(key);

        match self.entries.get(key) {
            Some(slot) => match &slot.value {
                Value::Hash(map) => Ok(map.get(field).cloned()),
                Value::Str(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn hset_with_expiry(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_available()?;

        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));

        if slot.is_expired() {
            *slot = Slot::new(Value::Hash(HashMap::new()));
        }

        match &mut slot.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
            }
            Value::Str(_) => return Err(wrong_type(key)),
        }
        slot.expires_at = Some(Instant::now() + ttl);

        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.ensure_available()?;
        self.purge_expired(key);

        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                Value::Hash(map) => {
                    let removed = map.remove(field).is_some();
                    (removed, map.is_empty())
                }
                Value::Str(_) => return Err(wrong_type(key)),
            },
            None => return Ok(false),
        };

        // Redis drops a hash once its last field is gone
        if now_empty {
            self.entries
                .remove_if(key, |_, slot| matches!(&slot.value, Value::Hash(m) if m.is_empty()));
        }

        Ok(removed)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Primary Store
// =============================================================================

/// Content rows kept in an ordered map.
#[derive(Debug)]
pub struct InMemoryContentStore {
    rows: RwLock<BTreeMap<ItemId, ContentItem>>,
    available: AtomicBool,
    reads: AtomicU64,
    scans: AtomicU64,
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// Create a store pre-populated with `items`.
    pub fn with_items(items: impl IntoIterator<Item = ContentItem>) -> Self {
        let store = Self::new();
        {
            let mut rows = store.rows.write();
            for item in items {
                rows.insert(item.id, item);
            }
        }
        store
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `get_item` calls served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `changed_since` scans served.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn get_item(&self, id: ItemId) -> Result<Option<ContentItem>> {
        self.ensure_available()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.read().get(&id).filter(|i| !i.is_delete).cloned())
    }

    async fn save_item(&self, item: &ContentItem) -> Result<()> {
        self.ensure_available()?;
        self.rows.write().insert(item.id, item.clone());
        Ok(())
    }

    async fn soft_delete(&self, id: ItemId, at: DateTime<Utc>) -> Result<bool> {
        self.ensure_available()?;
        match self.rows.write().get_mut(&id) {
            Some(item) => {
                item.mark_deleted(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<ContentItem>> {
        self.ensure_available()?;
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .read()
            .values()
            .filter(|i| i.update_time >= since)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

/// User roles kept in a map.
#[derive(Debug)]
pub struct InMemoryAccountStore {
    roles: RwLock<HashMap<UserId, UserRole>>,
    available: AtomicBool,
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            roles: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Register a user with the given role.
    pub fn insert(&self, user_id: UserId, role: UserRole) {
        self.roles.write().insert(user_id, role);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_role(&self, user_id: UserId) -> Result<Option<UserRole>> {
        self.ensure_available()?;
        Ok(self.roles.read().get(&user_id).copied())
    }

    async fn set_role(&self, user_id: UserId, role: UserRole) -> Result<bool> {
        self.ensure_available()?;
        match self.roles.write().get_mut(&user_id) {
            Some(current) => {
                *current = role;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// =============================================================================
// Message Broker
// =============================================================================

#[derive(Debug, Clone)]
struct Pending {
    body: Bytes,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    unacked: HashMap<u64, Pending>,
}

/// In-process queue with manual acknowledgement.
///
/// Unacknowledged deliveries are tracked per queue; a negative
/// acknowledgement with requeue puts the message back at the head and marks
/// it redelivered.
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_tag: AtomicU64,
    available: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            next_tag: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Return every unacknowledged delivery to the queue, as the broker does
    /// when a consumer connection drops.
    pub fn requeue_unacked(&self, queue: &str) -> usize {
        let count = {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
            tags.sort_unstable();
            let count = tags.len();
            for tag in tags.into_iter().rev() {
                if let Some(mut pending) = state.unacked.remove(&tag) {
                    pending.redelivered = true;
                    state.ready.push_front(pending);
                }
            }
            count
        };
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Broker("connection refused".to_string()))
        }
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue)?;
        let pending = state.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            tag,
            body: pending.body.clone(),
            redelivered: pending.redelivered,
        };
        state.unacked.insert(tag, pending);
        Some(delivery)
    }

    fn settle(&self, queue: &str, tag: u64) -> Result<Pending> {
        self.queues
            .lock()
            .get_mut(queue)
            .and_then(|state| state.unacked.remove(&tag))
            .ok_or_else(|| Error::Broker(format!("unknown delivery tag {} on {}", tag, queue)))
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, queue: &str, body: Bytes) -> Result<()> {
        self.ensure_available()?;
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Pending {
                body,
                redelivered: false,
            });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, delivery: &Delivery) -> Result<()> {
        self.ensure_available()?;
        self.settle(queue, delivery.tag).map(|_| ())
    }

    async fn nack(&self, queue: &str, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_available()?;
        let mut pending = self.settle(queue, delivery.tag)?;

        if requeue {
            pending.redelivered = true;
            self.queues
                .lock()
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_front(pending);
            self.notify.notify_waiters();
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cache_get_set_delete() {
        let cache = InMemoryFastCache::new();

        assert!(cache.get("k").await.unwrap().is_none());
        cache.set("k", Bytes::from("v"), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Persistent);

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let cache = InMemoryFastCache::new();
        cache
            .set("short", Bytes::from("v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_with_expiry_only_sets_ttl_on_create() {
        let cache = InMemoryFastCache::new();
        let ttl = Duration::from_secs(180);

        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 1);
        assert!(cache.ttl("c").await.unwrap().has_expiry());
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 2);

        // A counter created without expiry never gains one later
        assert_eq!(cache.incr("plain").await.unwrap(), 1);
        assert_eq!(cache.incr_with_expiry("plain", ttl).await.unwrap(), 2);
        assert_eq!(cache.ttl("plain").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let cache = InMemoryFastCache::new();
        cache.set("s", Bytes::from("abc"), None).await.unwrap();
        assert_matches!(cache.incr("s").await, Err(Error::CacheUnavailable(_)));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let cache = Arc::new(InMemoryFastCache::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .incr_with_expiry("hot", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=64).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_set_bit_uses_msb_first_order() {
        let cache = InMemoryFastCache::new();
        assert!(!cache.set_bit("b", 0, true).await.unwrap());
        assert!(!cache.set_bit("b", 9, true).await.unwrap());
        assert!(cache.set_bit("b", 9, true).await.unwrap());

        let raw = cache.get("b").await.unwrap().unwrap();
        assert_eq!(raw.as_ref(), &[0b1000_0000, 0b0100_0000]);
    }

    #[tokio::test]
    async fn test_hash_fields_and_wrong_type() {
        let cache = InMemoryFastCache::new();
        let ttl = Duration::from_secs(60);

        cache.hset_with_expiry("h", "pc", "t1", ttl).await.unwrap();
        cache.hset_with_expiry("h", "mobile", "t2", ttl).await.unwrap();
        assert_eq!(cache.hget("h", "pc").await.unwrap().as_deref(), Some("t1"));
        assert!(cache.ttl("h").await.unwrap().has_expiry());

        assert!(cache.hdel("h", "pc").await.unwrap());
        assert!(!cache.hdel("h", "pc").await.unwrap());
        assert_eq!(cache.hget("h", "mobile").await.unwrap().as_deref(), Some("t2"));

        assert!(cache.hdel("h", "mobile").await.unwrap());
        assert_eq!(cache.ttl("h").await.unwrap(), KeyTtl::Missing);

        cache.set("s", Bytes::from("1"), None).await.unwrap();
        assert_matches!(cache.hget("s", "f").await, Err(Error::CacheUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unavailable_cache_fails_every_call() {
        let cache = InMemoryFastCache::new();
        cache.set_available(false);
        assert_matches!(cache.get("k").await, Err(Error::CacheUnavailable(_)));
        assert_matches!(
            cache.incr_with_expiry("k", Duration::from_secs(1)).await,
            Err(Error::CacheUnavailable(_))
        );
        assert!(!cache.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_content_store_scoping() {
        let now = Utc::now();
        let store = InMemoryContentStore::with_items(vec![
            ContentItem::new(1u64, 1u64, "a").at(now),
            ContentItem::new(2u64, 1u64, "b").at(now - chrono::Duration::hours(1)),
        ]);

        assert!(store.soft_delete(ItemId::new(1), now).await.unwrap());
        assert!(!store.soft_delete(ItemId::new(99), now).await.unwrap());

        // Scoped read hides the soft-deleted row, the sync scan does not
        assert!(store.get_item(ItemId::new(1)).await.unwrap().is_none());
        let changed = store
            .changed_since(now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].is_delete);
        assert_eq!(store.reads(), 1);
        assert_eq!(store.scans(), 1);
    }

    #[tokio::test]
    async fn test_account_store_roles() {
        let accounts = InMemoryAccountStore::new();
        accounts.insert(UserId::new(1), UserRole::User);

        assert!(accounts.set_role(UserId::new(1), UserRole::Ban).await.unwrap());
        assert!(!accounts.set_role(UserId::new(2), UserRole::Ban).await.unwrap());
        assert_eq!(
            accounts.get_role(UserId::new(1)).await.unwrap(),
            Some(UserRole::Ban)
        );
    }

    #[tokio::test]
    async fn test_broker_ack_and_requeue() {
        let broker = InMemoryBroker::new();
        broker.publish("q", Bytes::from("one")).await.unwrap();
        broker.publish("q", Bytes::from("two")).await.unwrap();

        let first = broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, Bytes::from("one"));
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_len("q"), 1);

        broker.nack("q", &first, true).await.unwrap();
        let again = broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.body, Bytes::from("one"));
        assert!(again.redelivered);

        broker.ack("q", &again).await.unwrap();
        assert_matches!(broker.ack("q", &again).await, Err(Error::Broker(_)));

        let second = broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.nack("q", &second, false).await.unwrap();
        assert_eq!(broker.ready_len("q"), 0);
        assert_eq!(broker.unacked_len("q"), 0);
    }

    #[tokio::test]
    async fn test_broker_receive_times_out_then_wakes() {
        let broker = Arc::new(InMemoryBroker::new());
        assert!(broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("q", Bytes::from("late")).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.body, Bytes::from("late"));
    }

    #[tokio::test]
    async fn test_broker_requeue_unacked_on_disconnect() {
        let broker = InMemoryBroker::new();
        broker.publish("q", Bytes::from("x")).await.unwrap();
        let d = broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!d.redelivered);

        assert_eq!(broker.requeue_unacked("q"), 1);
        let d = broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(d.redelivered);
    }
}
