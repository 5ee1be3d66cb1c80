//! Hot-Key Cache
//!
//! Cache-aside reads for content items:
//!
//! ```text
//! read(id) ──▶ INCR question:count:{id} ──▶ hot? ──yes──▶ GET question:cache:{id}
//!                                             │                  │ hit: return
//!                                             no                 │ miss / corrupt
//!                                             ▼                  ▼
//!                                       primary store ◀──────────┘
//!                                             │ hot miss: SET question:cache:{id}
//! ```

pub mod hot_key;
pub mod metrics;
pub mod policy;

pub use hot_key::{HotKeyCache, InterceptOutcome};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::HotKeyPolicy;
