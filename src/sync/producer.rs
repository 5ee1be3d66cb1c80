//! Sync Producer
//!
//! Scans the primary store on a fixed timer and publishes every changed row,
//! soft-deleted ones included, to the sync queue as one JSON batch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::watermark::{SyncWatermark, SyncWindow};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{ContentStore, EventPublisher, MessageBroker};
use crate::error::Result;
use crate::metrics::{SYNC_FAILURES, SYNC_ITEMS_PUBLISHED};

/// Outcome of one producer cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub window: SyncWindow,
    /// Rows published (0 when nothing changed and no message was sent)
    pub published: usize,
}

pub struct SyncProducer {
    store: Arc<dyn ContentStore>,
    broker: Arc<dyn MessageBroker>,
    watermark: SyncWatermark,
    queue: String,
    interval: Duration,
    events: Arc<dyn EventPublisher>,
}

impl SyncProducer {
    pub fn new(
        store: Arc<dyn ContentStore>,
        broker: Arc<dyn MessageBroker>,
        watermark: SyncWatermark,
        queue: impl Into<String>,
        interval: Duration,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            broker,
            watermark,
            queue: queue.into(),
            interval,
            events,
        }
    }

    pub fn watermark(&self) -> &SyncWatermark {
        &self.watermark
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Scan and publish once.
    ///
    /// The watermark only advances when the batch was handed to the broker,
    /// so a failed cycle is retried by a later, wider window.
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let window = self.watermark.begin(now);

        let items = self.store.changed_since(window.from).await.map_err(|e| {
            SYNC_FAILURES.with_label_values(&["scan"]).inc();
            e
        })?;

        if items.is_empty() {
            debug!(from = %window.from, "No changed rows");
            self.watermark.commit(&window).await;
            return Ok(CycleReport {
                window,
                published: 0,
            });
        }

        let body = Bytes::from(serde_json::to_vec(&items)?);
        self.broker.publish(&self.queue, body).await.map_err(|e| {
            SYNC_FAILURES.with_label_values(&["publish"]).inc();
            e
        })?;

        self.watermark.commit(&window).await;

        let published = items.len();
        SYNC_ITEMS_PUBLISHED.inc_by(published as u64);
        info!(
            published,
            from = %window.from,
            to = %window.to,
            "Published changed rows"
        );
        let _ = self
            .events
            .publish(DomainEvent::sync_batch_published(published, window.from, window.to))
            .await;

        Ok(CycleReport { window, published })
    }

    /// Run cycles on the timer until cancelled.
    ///
    /// A cycle runs to completion before the next tick is awaited, so cycles
    /// never overlap; ticks missed while a cycle runs are delayed, not
    /// bunched.
    pub async fn run(&self, cancel: CancellationToken) {
        self.watermark.load().await;

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = %self.queue,
            interval_secs = self.interval.as_secs(),
            mode = ?self.watermark.mode(),
            "Sync producer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!(error = %e, "Sync cycle failed, next tick retries");
                    }
                }
            }
        }

        info!("Sync producer stopped");
    }
}
