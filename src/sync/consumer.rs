//! Sync Consumer
//!
//! Drains the sync queue and upserts each batch into the search index.
//!
//! Delivery is at-least-once. A message is acknowledged only after the whole
//! batch is committed to the index; an index failure requeues it. A body that
//! is not a JSON array is discarded, and individual items that cannot be
//! decoded are dropped while their siblings are still indexed.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    ContentItem, Delivery, EventPublisher, IndexDocument, MessageBroker, SearchIndex,
};
use crate::error::{Error, Result};
use crate::metrics::{SYNC_FAILURES, SYNC_ITEMS_DROPPED, SYNC_ITEMS_INDEXED};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Batch upserted and acknowledged
    Indexed { indexed: usize, dropped: usize },
    /// Body undecodable, message dropped without requeue
    Discarded,
    /// Index rejected the batch, message returned to the queue
    Requeued,
}

/// Decode a queued batch into index documents.
///
/// Returns the documents and the number of items that were dropped.
pub fn decode_batch(body: &[u8]) -> Result<(Vec<IndexDocument>, usize)> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(body)?;

    let mut documents = Vec::with_capacity(values.len());
    let mut dropped = 0;
    for value in values {
        match serde_json::from_value::<ContentItem>(value) {
            Ok(item) => documents.push(IndexDocument::from(&item)),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable item from sync batch");
                dropped += 1;
            }
        }
    }

    Ok((documents, dropped))
}

pub struct SyncConsumer {
    broker: Arc<dyn MessageBroker>,
    index: Arc<dyn SearchIndex>,
    queue: String,
    receive_wait: Duration,
    retry_backoff: Duration,
    events: Arc<dyn EventPublisher>,
}

impl SyncConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        index: Arc<dyn SearchIndex>,
        queue: impl Into<String>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            broker,
            index,
            queue: queue.into(),
            receive_wait: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
            events,
        }
    }

    /// How long one receive call blocks waiting for a message.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Pause after a requeue or broker error before receiving again.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Process one delivery and settle it with the broker.
    ///
    /// Errors are only returned when the broker rejects the ack/nack itself;
    /// the message then stays unacknowledged and is redelivered.
    #[instrument(skip(self, delivery), fields(tag = delivery.tag, redelivered = delivery.redelivered))]
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<BatchOutcome> {
        let (documents, dropped) = match decode_batch(&delivery.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable sync batch");
                SYNC_FAILURES.with_label_values(&["decode"]).inc();
                self.settle(self.broker.nack(&self.queue, &delivery, false).await)?;
                let _ = self
                    .events
                    .publish(DomainEvent::sync_batch_rejected(false, e.to_string()))
                    .await;
                return Ok(BatchOutcome::Discarded);
            }
        };

        SYNC_ITEMS_DROPPED.inc_by(dropped as u64);

        if !documents.is_empty() {
            if let Err(e) = self.index.upsert(&documents).await {
                error!(error = %e, items = documents.len(), "Index upsert failed, requeueing batch");
                SYNC_FAILURES.with_label_values(&["index"]).inc();
                self.settle(self.broker.nack(&self.queue, &delivery, true).await)?;
                let _ = self
                    .events
                    .publish(DomainEvent::sync_batch_rejected(true, e.to_string()))
                    .await;
                return Ok(BatchOutcome::Requeued);
            }
        }

        self.settle(self.broker.ack(&self.queue, &delivery).await)?;

        let indexed = documents.len();
        SYNC_ITEMS_INDEXED.inc_by(indexed as u64);
        debug!(indexed, dropped, "Sync batch indexed");
        let _ = self
            .events
            .publish(DomainEvent::sync_batch_indexed(
                indexed,
                dropped,
                delivery.redelivered,
            ))
            .await;

        Ok(BatchOutcome::Indexed { indexed, dropped })
    }

    fn settle(&self, result: Result<()>) -> Result<()> {
        result.map_err(|e| {
            SYNC_FAILURES.with_label_values(&["ack"]).inc();
            e
        })
    }

    /// Process messages until the queue stays empty for one receive wait.
    ///
    /// Returns the number of deliveries handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(delivery) = self.broker.receive(&self.queue, self.receive_wait).await? {
            if self.handle_delivery(delivery).await? == BatchOutcome::Requeued {
                return Err(Error::Index(
                    "search index rejected a batch, left on the queue".to_string(),
                ));
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Consume until cancelled.
    ///
    /// Cancellation is only observed while waiting for a message; a batch
    /// that has been received is always processed and settled first.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(queue = %self.queue, "Sync consumer started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.broker.receive(&self.queue, self.receive_wait) => received,
            };

            let backoff = match received {
                Ok(Some(delivery)) => match self.handle_delivery(delivery).await {
                    Ok(BatchOutcome::Requeued) => true,
                    Ok(_) => false,
                    Err(e) => {
                        error!(error = %e, "Failed to settle sync batch");
                        true
                    }
                },
                Ok(None) => false,
                Err(e) => {
                    warn!(error = %e, "Sync queue receive failed");
                    true
                }
            };

            if backoff {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
            }
        }

        info!(queue = %self.queue, "Sync consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::InMemoryBroker;
    use crate::adapters::tantivy_index::TantivySearchIndex;
    use crate::domain::ports::SearchQuery;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct FailingIndex;

    #[async_trait]
    impl SearchIndex for FailingIndex {
        async fn upsert(&self, _documents: &[IndexDocument]) -> Result<()> {
            Err(Error::Index("cluster red".to_string()))
        }

        async fn get(&self, _id: u64) -> Result<Option<IndexDocument>> {
            Ok(None)
        }

        async fn search(&self, _query: &SearchQuery) -> Result<crate::domain::ports::SearchPage> {
            Ok(Default::default())
        }
    }

    fn batch(items: &[ContentItem]) -> Bytes {
        Bytes::from(serde_json::to_vec(items).unwrap())
    }

    async fn next(broker: &InMemoryBroker) -> Delivery {
        broker
            .receive("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_decode_drops_bad_items_only() {
        let good = serde_json::to_value(ContentItem::new(1u64, 1u64, "ok")).unwrap();
        let body = serde_json::to_vec(&serde_json::json!([good, {"id": "nope"}])).unwrap();

        let (docs, dropped) = decode_batch(&body).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(dropped, 1);

        assert!(decode_batch(b"{\"not\":\"an array\"}").is_err());
    }

    #[tokio::test]
    async fn test_indexed_batch_is_acked() {
        let broker = Arc::new(InMemoryBroker::new());
        let index = Arc::new(TantivySearchIndex::in_memory().unwrap());
        let consumer = SyncConsumer::new(
            broker.clone(),
            index.clone(),
            "q",
            Arc::new(InMemoryEventCollector::new()),
        );

        broker
            .publish("q", batch(&[ContentItem::new(1u64, 1u64, "Pinning")]))
            .await
            .unwrap();
        let outcome = consumer.handle_delivery(next(&broker).await).await.unwrap();

        assert_eq!(outcome, BatchOutcome::Indexed { indexed: 1, dropped: 0 });
        assert_eq!(broker.unacked_len("q"), 0);
        assert!(index.get(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_garbage_body_is_discarded() {
        let broker = Arc::new(InMemoryBroker::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let consumer = SyncConsumer::new(
            broker.clone(),
            Arc::new(FailingIndex),
            "q",
            events.clone(),
        );

        broker.publish("q", Bytes::from_static(b"garbage")).await.unwrap();
        let outcome = consumer.handle_delivery(next(&broker).await).await.unwrap();

        assert_eq!(outcome, BatchOutcome::Discarded);
        assert_eq!(broker.ready_len("q"), 0);
        assert_eq!(broker.unacked_len("q"), 0);
        assert_eq!(events.events_of_type("SyncBatchRejected").len(), 1);
    }

    #[tokio::test]
    async fn test_index_failure_requeues() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = SyncConsumer::new(
            broker.clone(),
            Arc::new(FailingIndex),
            "q",
            Arc::new(InMemoryEventCollector::new()),
        );

        broker
            .publish("q", batch(&[ContentItem::new(1u64, 1u64, "x")]))
            .await
            .unwrap();
        let outcome = consumer.handle_delivery(next(&broker).await).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Requeued);

        let again = next(&broker).await;
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_drain_reports_index_failure() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = SyncConsumer::new(
            broker.clone(),
            Arc::new(FailingIndex),
            "q",
            Arc::new(InMemoryEventCollector::new()),
        )
        .with_receive_wait(Duration::from_millis(10));

        assert_eq!(consumer.drain().await.unwrap(), 0);

        broker
            .publish("q", batch(&[ContentItem::new(1u64, 1u64, "x")]))
            .await
            .unwrap();
        assert!(consumer.drain().await.is_err());
        assert_eq!(broker.ready_len("q"), 1);
    }

    #[tokio::test]
    async fn test_run_finishes_and_stops_on_cancel() {
        let broker = Arc::new(InMemoryBroker::new());
        let index = Arc::new(TantivySearchIndex::in_memory().unwrap());
        let consumer = Arc::new(
            SyncConsumer::new(
                broker.clone(),
                index.clone(),
                "q",
                Arc::new(InMemoryEventCollector::new()),
            )
            .with_receive_wait(Duration::from_millis(20)),
        );
        let cancel = CancellationToken::new();

        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        broker
            .publish("q", batch(&[ContentItem::new(8u64, 1u64, "Send")]))
            .await
            .unwrap();

        for _ in 0..100 {
            if index.get(8).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(index.get(8).await.unwrap().is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
