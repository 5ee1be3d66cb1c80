//! Sync Watermark
//!
//! Computes the window of rows each producer cycle scans.
//!
//! In `Rolling` mode every cycle looks back a fixed width from now. A cycle
//! that fails is only recovered if the next successful cycle still reaches
//! back far enough.
//!
//! In `Persisted` mode the end of the last successfully published window is
//! remembered, and the next window starts at whichever is earlier: that point
//! or `now - width`. Consecutive failures therefore widen the next window
//! instead of opening a gap. The value is mirrored to the fast cache so a
//! restarted producer resumes from it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::ports::FastCache;

/// Fast cache key holding the persisted watermark (epoch milliseconds).
pub const WATERMARK_KEY: &str = "sync:watermark";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkMode {
    /// Always scan `now - width`
    Rolling,
    /// Resume from the last covered instant
    #[default]
    Persisted,
}

/// Rows with `update_time >= from` are scanned; `to` is the scan instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub struct SyncWatermark {
    mode: WatermarkMode,
    width: chrono::Duration,
    last_covered: Mutex<Option<DateTime<Utc>>>,
    store: Option<Arc<dyn FastCache>>,
}

impl SyncWatermark {
    pub fn new(mode: WatermarkMode, width: Duration) -> Self {
        Self {
            mode,
            width: chrono::Duration::from_std(width).unwrap_or(chrono::Duration::MAX),
            last_covered: Mutex::new(None),
            store: None,
        }
    }

    /// Mirror the watermark to a fast cache.
    pub fn with_store(mut self, store: Arc<dyn FastCache>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mode(&self) -> WatermarkMode {
        self.mode
    }

    pub fn last_covered(&self) -> Option<DateTime<Utc>> {
        *self.last_covered.lock()
    }

    /// Reload the persisted value. Missing or unreadable values are ignored.
    pub async fn load(&self) -> Option<DateTime<Utc>> {
        if self.mode != WatermarkMode::Persisted {
            return None;
        }
        let store = self.store.as_ref()?;

        let raw = match store.get(WATERMARK_KEY).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Could not load sync watermark, starting from the rolling window");
                return None;
            }
        };

        let loaded = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        match loaded {
            Some(at) => {
                let mut last = self.last_covered.lock();
                *last = Some(last.map_or(at, |current| current.max(at)));
                info!(watermark = %at, "Resuming sync from persisted watermark");
            }
            None => warn!("Ignoring unreadable persisted sync watermark"),
        }

        loaded
    }

    /// Window to scan for a cycle starting at `now`.
    pub fn begin(&self, now: DateTime<Utc>) -> SyncWindow {
        let rolling = now
            .checked_sub_signed(self.width)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let from = match (self.mode, self.last_covered()) {
            (WatermarkMode::Persisted, Some(last)) => last.min(rolling),
            _ => rolling,
        };

        SyncWindow { from, to: now }
    }

    /// Record that `window` was fully published, in memory only.
    pub fn advance(&self, window: &SyncWindow) {
        let mut last = self.last_covered.lock();
        *last = Some(last.map_or(window.to, |current| current.max(window.to)));
    }

    /// Record that `window` was fully published and mirror it to the store.
    pub async fn commit(&self, window: &SyncWindow) {
        self.advance(window);

        if self.mode != WatermarkMode::Persisted {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let Some(at) = self.last_covered() else {
            return;
        };

        let value = Bytes::from(at.timestamp_millis().to_string());
        match store.set(WATERMARK_KEY, value, None).await {
            Ok(()) => debug!(watermark = %at, "Persisted sync watermark"),
            Err(e) => warn!(error = %e, "Failed to persist sync watermark"),
        }
    }
}
