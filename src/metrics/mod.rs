//! Metrics module
//!
//! Process-wide Prometheus collectors. Each collector is registered with the
//! default registry the first time it is touched.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

use crate::error::{Error, Result};

/// Cache-aside lookups by outcome (`hit`, `miss`, `cold`, `corrupt`, `error`).
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "qbank_cache_lookups_total",
        "Hot-key cache lookups by outcome",
        &["outcome"]
    )
    .expect("valid metric definition")
});

pub static CACHE_WRITE_BACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "qbank_cache_write_backs_total",
        "Payloads written back after a hot miss"
    )
    .expect("valid metric definition")
});

pub static SYNC_ITEMS_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "qbank_sync_items_published_total",
        "Changed rows published to the sync queue"
    )
    .expect("valid metric definition")
});

pub static SYNC_ITEMS_INDEXED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "qbank_sync_items_indexed_total",
        "Documents upserted into the search index"
    )
    .expect("valid metric definition")
});

pub static SYNC_ITEMS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "qbank_sync_items_dropped_total",
        "Queued items dropped because they could not be decoded"
    )
    .expect("valid metric definition")
});

/// Sync failures by stage (`scan`, `publish`, `decode`, `index`, `ack`).
pub static SYNC_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "qbank_sync_failures_total",
        "Index sync failures by stage",
        &["stage"]
    )
    .expect("valid metric definition")
});

/// Authorization denials by internal reason.
pub static AUTH_DENIALS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "qbank_auth_denials_total",
        "Requests rejected as not logged in, by reason",
        &["reason"]
    )
    .expect("valid metric definition")
});

pub static ACCOUNTS_SUSPENDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "qbank_accounts_suspended_total",
        "Accounts banned by the abuse throttle"
    )
    .expect("valid metric definition")
});

/// Force registration of every collector so `/metrics` lists them from the start.
pub fn register_all() {
    Lazy::force(&CACHE_LOOKUPS);
    Lazy::force(&CACHE_WRITE_BACKS);
    Lazy::force(&SYNC_ITEMS_PUBLISHED);
    Lazy::force(&SYNC_ITEMS_INDEXED);
    Lazy::force(&SYNC_ITEMS_DROPPED);
    Lazy::force(&SYNC_FAILURES);
    Lazy::force(&AUTH_DENIALS);
    Lazy::force(&ACCOUNTS_SUSPENDED);
}

/// Encode the default registry in the Prometheus text format.
///
/// Returns the content type together with the body.
pub fn encode_text() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
