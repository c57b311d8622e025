pub mod broker;

pub use broker::{EventBroker, EventStream, Subscription};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Immutable record of one request outcome, created by the proxy handler and
/// fanned out by the broker to live subscribers and the analytics sink.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    /// Uppercase HTTP method.
    pub method: String,
    /// Request path, no query string.
    pub path: String,
    pub allowed: bool,
    /// Empty when the global fallback limiter decided.
    pub rule_name: String,
    /// 0 when unknown (fail-open).
    pub limit: i64,
    /// 0 when unknown (fail-open).
    pub remaining: i64,
    pub status: u16,
    /// Upstream exchange duration; 0 on the denied path.
    pub response_ms: i64,
}
