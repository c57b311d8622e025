use crate::limiter::store::{
    bucket_of, decision, elapsed_in_bucket, now_epoch_ms, weighted_estimate, window_ms,
    LimitDecision, StoreError, WindowStore,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Single-process window store with the same two-bucket math as the Redis
/// backend. Meant for development and tests; it cannot coordinate across
/// gateway instances.
///
/// Entries that have not been touched for `GC_EXPIRE_SECS` are periodically
/// evicted so dynamic identities (per-user keys under `/api/users/:id`-style
/// rules) do not grow the map without bound.
pub struct MemoryWindowStore {
    windows: DashMap<String, Arc<Window>>,
}

struct Window {
    inner: Mutex<WindowInner>,
    /// Last access epoch ms, updated outside the lock.
    last_access: AtomicU64,
}

struct WindowInner {
    bucket: i64,
    cur: i64,
    prev: i64,
}

const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap; beyond it the oldest entries are force-evicted.
const MAX_ENTRIES: usize = 100_000;

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, key: &str) -> Arc<Window> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.windows.get(key) {
            return entry.value().clone();
        }
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Window {
                    inner: Mutex::new(WindowInner {
                        bucket: -1,
                        cur: 0,
                        prev: 0,
                    }),
                    last_access: AtomicU64::new(now_epoch_ms() as u64),
                })
            })
            .clone()
    }

    async fn check_at(
        &self,
        key: &str,
        limit: u64,
        w_ms: i64,
        now_ms: i64,
    ) -> LimitDecision {
        let window = self.window(key);
        window.last_access.store(now_ms as u64, Ordering::Relaxed);

        let mut inner = window.inner.lock().await;
        inner.roll_to(bucket_of(now_ms, w_ms));

        let estimated = weighted_estimate(
            inner.prev,
            inner.cur,
            elapsed_in_bucket(now_ms, w_ms),
            w_ms,
        );
        let allowed = estimated < limit as i64;
        if allowed {
            inner.cur += 1;
        }
        decision(allowed, limit, estimated, now_ms, w_ms)
    }

    /// Spawn a background task that periodically evicts stale entries.
    pub fn start_gc(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                store.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let now = now_epoch_ms() as u64;
        let expire_ms = GC_EXPIRE_SECS * 1000;

        self.windows
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_ms);

        let overflow = self.windows.len().saturating_sub(MAX_ENTRIES);
        if overflow > 0 {
            let mut entries: Vec<(String, u64)> = self
                .windows
                .iter()
                .map(|r| {
                    let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                    (r.key().clone(), age)
                })
                .collect();
            entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in entries.into_iter().take(overflow) {
                self.windows.remove(&key);
            }
        }
    }
}

impl WindowInner {
    /// Advance to `bucket`, shifting the current count into the previous slot
    /// when moving exactly one bucket forward and clearing both otherwise.
    fn roll_to(&mut self, bucket: i64) {
        if bucket == self.bucket {
            return;
        }
        if bucket == self.bucket + 1 {
            self.prev = self.cur;
        } else {
            self.prev = 0;
        }
        self.cur = 0;
        self.bucket = bucket;
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn check_sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<LimitDecision, StoreError> {
        Ok(self
            .check_at(key, limit, window_ms(window), now_epoch_ms())
            .await)
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let w_ms = window_ms(window);
        let now = now_epoch_ms();
        let win = self.window(key);
        win.last_access.store(now as u64, Ordering::Relaxed);

        let mut inner = win.inner.lock().await;
        inner.roll_to(bucket_of(now, w_ms));
        inner.cur += 1;
        Ok(inner.cur)
    }

    async fn get_count(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let w_ms = window_ms(window);
        let now = now_epoch_ms();
        let Some(win) = self.windows.get(key).map(|e| e.value().clone()) else {
            return Ok(0);
        };

        let mut inner = win.inner.lock().await;
        inner.roll_to(bucket_of(now, w_ms));
        Ok(weighted_estimate(
            inner.prev,
            inner.cur,
            elapsed_in_bucket(now, w_ms),
            w_ms,
        ))
    }

    async fn reset(&self, key: &str, _window: Duration) -> Result<(), StoreError> {
        self.windows.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
