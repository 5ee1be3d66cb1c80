//! Redis Reliable Queue Adapter
//!
//! Implements the `MessageBroker` port with the reliable-queue pattern over
//! Redis lists:
//!
//! ```text
//! publish:  LPUSH queue
//! receive:  BLMOVE queue queue:processing RIGHT LEFT
//! ack:      LREM queue:processing
//! requeue:  LREM queue:processing + RPUSH queue   (back to the consumption end)
//! recover:  LMOVE queue:processing queue          (consumer crashed mid-batch)
//! ```
//!
//! A message removed from the queue stays in the processing list until it is
//! settled, so nothing is lost when a consumer dies. A delivery tag stays
//! valid until its ack or nack has reached Redis, so a failed settle can be
//! retried.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::{AsyncCommands, Direction};
use tracing::{info, warn};

use crate::domain::ports::{Delivery, MessageBroker};
use crate::error::{Error, Result};

fn broker_error(e: impl std::fmt::Display) -> Error {
    Error::Broker(e.to_string())
}

/// Processing list paired with `queue`.
pub fn processing_list(queue: &str) -> String {
    format!("{}:processing", queue)
}

/// Payloads most recently put back on a queue by this process, oldest
/// forgotten first.
///
/// Only fingerprints are kept. A payload that another process consumes is
/// never taken back out, so the record is capped.
#[derive(Debug)]
pub struct ReturnedPayloads {
    fingerprints: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl ReturnedPayloads {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fingerprints: Mutex::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    fn fingerprint(payload: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        hasher.finish()
    }

    pub fn insert(&self, payload: &[u8]) {
        let mut fingerprints = self.fingerprints.lock();
        if fingerprints.len() >= self.capacity {
            fingerprints.pop_front();
        }
        fingerprints.push_back(Self::fingerprint(payload));
    }

    /// Forget `payload`, returning whether it was recorded.
    pub fn take(&self, payload: &[u8]) -> bool {
        let fingerprint = Self::fingerprint(payload);
        let mut fingerprints = self.fingerprints.lock();
        match fingerprints.iter().position(|f| *f == fingerprint) {
            Some(pos) => {
                fingerprints.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReturnedPayloads {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

pub struct RedisQueueBroker {
    pool: Pool,
    /// Payloads delivered and not yet settled, by (queue, tag)
    in_flight: DashMap<(String, u64), Vec<u8>>,
    /// Payloads this process put back on a queue
    returned: ReturnedPayloads,
    next_tag: AtomicU64,
}

impl RedisQueueBroker {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            in_flight: DashMap::new(),
            returned: ReturnedPayloads::default(),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Deliveries received and not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Move everything left in the processing list back onto the queue.
    ///
    /// Run once at startup, before any consumer of `queue` is started.
    pub async fn recover_in_flight(&self, queue: &str) -> Result<usize> {
        let processing = processing_list(queue);
        let mut conn = self.pool.get().await.map_err(broker_error)?;

        let mut recovered = 0;
        loop {
            let moved: Option<Vec<u8>> = conn
                .lmove(&processing, queue, Direction::Right, Direction::Right)
                .await
                .map_err(broker_error)?;
            match moved {
                Some(payload) => {
                    self.returned.insert(&payload);
                    recovered += 1;
                }
                None => break,
            }
        }

        if recovered > 0 {
            warn!(queue, recovered, "Recovered unacknowledged sync batches");
        }
        Ok(recovered)
    }

    fn in_flight_payload(&self, queue: &str, delivery: &Delivery) -> Result<Vec<u8>> {
        self.in_flight
            .get(&(queue.to_string(), delivery.tag))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::Broker(format!("unknown delivery tag {} on {}", delivery.tag, queue))
            })
    }

    fn settled(&self, queue: &str, delivery: &Delivery) {
        self.in_flight.remove(&(queue.to_string(), delivery.tag));
    }
}

#[async_trait]
impl MessageBroker for RedisQueueBroker {
    async fn publish(&self, queue: &str, body: Bytes) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(broker_error)?;
        let _: i64 = conn
            .lpush(queue, body.as_ref())
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.pool.get().await.map_err(broker_error)?;
        // BLMOVE treats 0 as "block forever"
        let timeout = wait.as_secs_f64().max(0.01);
        let payload: Option<Vec<u8>> = conn
            .blmove(
                queue,
                processing_list(queue),
                Direction::Right,
                Direction::Left,
                timeout,
            )
            .await
            .map_err(broker_error)?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let redelivered = self.returned.take(&payload);
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.in_flight
            .insert((queue.to_string(), tag), payload.clone());

        Ok(Some(Delivery {
            tag,
            body: Bytes::from(payload),
            redelivered,
        }))
    }

    async fn ack(&self, queue: &str, delivery: &Delivery) -> Result<()> {
        let payload = self.in_flight_payload(queue, delivery)?;
        let mut conn = self.pool.get().await.map_err(broker_error)?;
        let _: i64 = conn
            .lrem(processing_list(queue), 1, payload.as_slice())
            .await
            .map_err(broker_error)?;
        self.settled(queue, delivery);
        Ok(())
    }

    async fn nack(&self, queue: &str, delivery: &Delivery, requeue: bool) -> Result<()> {
        let payload = self.in_flight_payload(queue, delivery)?;
        let mut conn = self.pool.get().await.map_err(broker_error)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(processing_list(queue), 1, payload.as_slice())
            .ignore();
        if requeue {
            pipe.rpush(queue, payload.as_slice()).ignore();
        }
        let () = pipe.query_async(&mut conn).await.map_err(broker_error)?;
        self.settled(queue, delivery);

        if requeue {
            self.returned.insert(&payload);
        } else {
            info!(queue, tag = delivery.tag, "Discarded sync batch");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::redis::RedisConfig;

    #[test]
    fn test_processing_list_name() {
        assert_eq!(processing_list("content_sync"), "content_sync:processing");
    }

    fn unreachable_broker() -> RedisQueueBroker {
        let pool = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 100,
            ..Default::default()
        }
        .create_pool()
        .unwrap();
        RedisQueueBroker::new(pool)
    }

    #[tokio::test]
    async fn test_unknown_tag_is_rejected_before_network() {
        let broker = unreachable_broker();
        let delivery = Delivery {
            tag: 42,
            body: Bytes::from_static(b"[]"),
            redelivered: false,
        };

        assert!(matches!(broker.ack("q", &delivery).await, Err(Error::Broker(_))));
        assert!(matches!(broker.publish("q", Bytes::new()).await, Err(Error::Broker(_))));
    }

    #[tokio::test]
    async fn test_failed_settle_keeps_delivery_retryable() {
        let broker = unreachable_broker();
        let delivery = Delivery {
            tag: 7,
            body: Bytes::from_static(b"[]"),
            redelivered: false,
        };
        broker
            .in_flight
            .insert(("q".to_string(), delivery.tag), delivery.body.to_vec());

        for _ in 0..2 {
            match broker.ack("q", &delivery).await {
                Err(Error::Broker(msg)) => assert!(!msg.contains("unknown delivery tag"), "{msg}"),
                other => panic!("expected a connection error, got {:?}", other),
            }
        }
        assert!(broker.nack("q", &delivery, true).await.is_err());
        assert_eq!(broker.in_flight_len(), 1);
    }

    #[test]
    fn test_returned_payloads_are_taken_once() {
        let returned = ReturnedPayloads::default();
        returned.insert(b"batch-a");

        assert!(returned.take(b"batch-a"));
        assert!(!returned.take(b"batch-a"));
        assert!(!returned.take(b"batch-b"));
        assert!(returned.is_empty());
    }

    #[test]
    fn test_returned_payloads_are_bounded() {
        let returned = ReturnedPayloads::with_capacity(3);
        for i in 0..10u8 {
            returned.insert(&[i]);
        }

        assert_eq!(returned.len(), 3);
        assert!(!returned.take(&[0]));
        assert!(returned.take(&[9]));
    }
}
