//! Index Sync Pipeline
//!
//! Eventually-consistent propagation of primary store changes into the search
//! index, with the message broker as the durable hand-off:
//!
//! ```text
//! ┌──────────────┐  changed rows  ┌──────────┐  JSON batch  ┌──────────────┐
//! │ SyncProducer │ ─────────────▶ │  queue   │ ───────────▶ │ SyncConsumer │ ──▶ search index
//! │ (one, timer) │                └──────────┘  ack / nack  │  (one or more)│
//! └──────────────┘                                          └──────────────┘
//! ```
//!
//! [`SyncPipeline::spawn`] starts both halves as background tasks and returns
//! a [`SyncHandle`]. Shutting the handle down cancels the tasks and waits for
//! them, letting a batch that is already being processed finish.

pub mod consumer;
pub mod document;
pub mod producer;
pub mod watermark;

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use consumer::{decode_batch, BatchOutcome, SyncConsumer};
pub use document::parse_tags;
pub use producer::{CycleReport, SyncProducer};
pub use watermark::{SyncWatermark, SyncWindow, WatermarkMode, WATERMARK_KEY};

/// A producer plus its consumers.
pub struct SyncPipeline {
    producer: Arc<SyncProducer>,
    consumers: Vec<Arc<SyncConsumer>>,
}

impl SyncPipeline {
    pub fn new(producer: SyncProducer, consumers: Vec<SyncConsumer>) -> Self {
        Self {
            producer: Arc::new(producer),
            consumers: consumers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn producer(&self) -> &Arc<SyncProducer> {
        &self.producer
    }

    pub fn consumers(&self) -> &[Arc<SyncConsumer>] {
        &self.consumers
    }

    /// Spawn the producer and every consumer. They stop when `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> SyncHandle {
        let mut tasks = Vec::with_capacity(self.consumers.len() + 1);

        let producer = self.producer.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { producer.run(token).await }));

        for consumer in &self.consumers {
            let consumer = consumer.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { consumer.run(token).await }));
        }

        info!(consumers = self.consumers.len(), "Sync pipeline started");
        SyncHandle { cancel, tasks }
    }
}

/// Running pipeline tasks.
pub struct SyncHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Cancel every task and wait until they have all returned.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Sync task ended abnormally");
            }
        }
        info!("Sync pipeline stopped");
    }
}
