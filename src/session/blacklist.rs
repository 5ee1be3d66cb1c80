//! Client address blacklist.
//!
//! Holds the set of client IPs refused before any session work is done. The
//! list is replaced as a whole on every reload: readers see either the old
//! set or the new one, never a partly rebuilt one.
//!
//! The source format is a comma or whitespace separated list of addresses.
//! IPv4-mapped IPv6 addresses match their IPv4 form.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Parse a blacklist source. Entries that are not IP addresses are skipped.
pub fn parse_entries(raw: &str) -> HashSet<IpAddr> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_canonical()),
            Err(_) => {
                warn!(entry, "Ignoring blacklist entry that is not an IP address");
                None
            }
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct Blacklist {
    entries: RwLock<Arc<HashSet<IpAddr>>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = IpAddr>) -> Self {
        let blacklist = Self::new();
        blacklist.replace_all(entries);
        blacklist
    }

    /// Swap in a new list. Returns the number of entries now loaded.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = IpAddr>) -> usize {
        let next: HashSet<IpAddr> = entries.into_iter().map(|ip| ip.to_canonical()).collect();
        let loaded = next.len();
        *self.entries.write() = Arc::new(next);
        loaded
    }

    pub fn reload_from_str(&self, raw: &str) -> usize {
        self.replace_all(parse_entries(raw))
    }

    /// Reload from a file. On a read error the current list is kept.
    pub async fn reload_from_file(&self, path: &std::path::Path) -> Result<usize> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(self.reload_from_str(&raw))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.entries.read().contains(&ip.to_canonical())
    }

    /// Current list; unaffected by later reloads.
    pub fn snapshot(&self) -> Arc<HashSet<IpAddr>> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload from `path` whenever its content changes, until cancelled.
    pub async fn watch_file(
        self: Arc<Self>,
        path: PathBuf,
        every: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<String> = None;

        info!(path = %path.display(), "Blacklist watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match tokio::fs::read_to_string(&path).await {
                        Ok(raw) if last.as_deref() == Some(raw.as_str()) => {}
                        Ok(raw) => {
                            let loaded = self.reload_from_str(&raw);
                            info!(loaded, "Blacklist reloaded");
                            last = Some(raw);
                        }
                        Err(e) => warn!(error = %e, "Blacklist unreadable, keeping current list"),
                    }
                }
            }
        }

        debug!("Blacklist watcher stopped");
    }
}
