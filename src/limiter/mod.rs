pub mod memory;
pub mod store;

pub use memory::MemoryWindowStore;
pub use store::{LimitDecision, RedisWindowStore, StoreError, WindowStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum LimiterError {
    EmptyIdentity,
    Store(StoreError),
}

impl fmt::Display for LimiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterError::EmptyIdentity => write!(f, "identity must not be empty"),
            LimiterError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LimiterError {}

/// Global-fallback limit policy: a fixed `(limit, window)` applied per
/// identity through the shared window store. Rule-scoped checks go to the
/// store directly with their own keys; this wrapper only serves requests no
/// rule claimed.
pub struct Limiter {
    store: Arc<dyn WindowStore>,
    limit: u64,
    window: Duration,
}

impl Limiter {
    pub fn new(
        store: Arc<dyn WindowStore>,
        limit: u64,
        window: Duration,
    ) -> Result<Self, crate::error::GatewayError> {
        if limit == 0 {
            return Err(crate::error::GatewayError::Config(
                "limiter limit must be positive".into(),
            ));
        }
        if window.is_zero() {
            return Err(crate::error::GatewayError::Config(
                "limiter window must be positive".into(),
            ));
        }
        Ok(Self {
            store,
            limit,
            window,
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn allow(&self, identity: &str) -> Result<LimitDecision, LimiterError> {
        if identity.is_empty() {
            return Err(LimiterError::EmptyIdentity);
        }
        let key = format!("global:{}", identity);
        self.store
            .check_sliding_window(&key, self.limit, self.window)
            .await
            .map_err(LimiterError::Store)
    }
}
