use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::fmt;
use std::time::Duration;

/// Outcome of one sliding-window check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub limit: i64,
    /// `max(0, limit - count)`.
    pub remaining: i64,
    /// When the oldest contribution to the window is projected to expire.
    pub reset_at: DateTime<Utc>,
    /// Weighted estimate including this request when admitted.
    pub count: i64,
}

/// The store failed to decide. Never conflated with a deny: callers fail
/// open on this.
#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store unavailable: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError(e.to_string())
    }
}

/// Remote atomic counter operations keyed by window bucket.
///
/// `check_sliding_window` must execute the read/compare/increment/expire
/// sequence atomically on the store: no interleaving with other clients
/// operating on the same key.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn check_sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<LimitDecision, StoreError>;

    /// Unconditionally bump the current bucket. Returns the new bucket count.
    async fn increment(&self, key: &str, window: Duration) -> Result<i64, StoreError>;

    /// Weighted estimate without admitting anything.
    async fn get_count(&self, key: &str, window: Duration) -> Result<i64, StoreError>;

    /// Drop both live buckets for a key.
    async fn reset(&self, key: &str, window: Duration) -> Result<(), StoreError>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Two-bucket window math, shared by the Redis script arguments and the
// in-memory backend.
// ---------------------------------------------------------------------------

pub(crate) fn window_ms(window: Duration) -> i64 {
    (window.as_millis() as i64).max(1)
}

pub(crate) fn bucket_of(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.div_euclid(window_ms)
}

pub(crate) fn elapsed_in_bucket(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.rem_euclid(window_ms)
}

/// `⌊prev · (1 − elapsed/W)⌋ + cur`
pub(crate) fn weighted_estimate(prev: i64, cur: i64, elapsed_ms: i64, window_ms: i64) -> i64 {
    let weight = 1.0 - (elapsed_ms as f64 / window_ms as f64);
    (prev as f64 * weight).floor() as i64 + cur
}

pub(crate) fn reset_instant(now_ms: i64, window_ms: i64) -> DateTime<Utc> {
    let reset_ms = (bucket_of(now_ms, window_ms) + 1) * window_ms;
    Utc.timestamp_millis_opt(reset_ms)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn decision(
    allowed: bool,
    limit: u64,
    estimated: i64,
    now_ms: i64,
    window_ms: i64,
) -> LimitDecision {
    let count = estimated + i64::from(allowed);
    LimitDecision {
        allowed,
        limit: limit as i64,
        remaining: (limit as i64 - count).max(0),
        reset_at: reset_instant(now_ms, window_ms),
        count,
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Reads both bucket counters, computes the weighted estimate, and only when
/// under the limit increments the current bucket and refreshes its TTL to
/// `2·W` so it survives long enough to serve as the previous bucket. Runs as
/// one script invocation, which Redis executes without interleaving.
const CHECK_WINDOW_LUA: &str = r#"
local cur = tonumber(redis.call('GET', KEYS[1])) or 0
local prev = tonumber(redis.call('GET', KEYS[2])) or 0
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local elapsed_ms = tonumber(ARGV[3])

local weight = 1 - (elapsed_ms / window_ms)
local estimated = math.floor(prev * weight) + cur

if estimated >= limit then
  return {0, estimated}
end

redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], window_ms * 2)
return {1, estimated}
"#;

/// Distributed sliding-window store on Redis.
///
/// `ConnectionManager` multiplexes and reconnects internally, so clones are
/// cheap and the store is shared across all request contexts. The check
/// script is sent via EVALSHA with automatic reload on script eviction
/// (`redis::Script` behavior).
pub struct RedisWindowStore {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
    /// Per-call budget; exceeding it surfaces as store-unavailable.
    timeout: Duration,
}

impl RedisWindowStore {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: Script::new(CHECK_WINDOW_LUA),
            key_prefix: key_prefix.into(),
            timeout,
        })
    }

    /// Bucket key: `prefix:{logical}:bucket`. The logical key is wrapped in
    /// a hash tag so both buckets of one identifier land on the same cluster
    /// shard and the script can touch them in one invocation.
    fn bucket_key(&self, key: &str, bucket: i64) -> String {
        format!("{}:{{{}}}:{}", self.key_prefix, key, bucket)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn check_sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<LimitDecision, StoreError> {
        let w = window_ms(window);
        let now = now_epoch_ms();
        let bucket = bucket_of(now, w);

        let mut conn = self.conn.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(self.bucket_key(key, bucket))
            .key(self.bucket_key(key, bucket - 1))
            .arg(limit)
            .arg(w)
            .arg(elapsed_in_bucket(now, w));

        let (allowed, estimated): (i64, i64) = self
            .with_timeout(invocation.invoke_async(&mut conn))
            .await?;
        Ok(decision(allowed == 1, limit, estimated, now, w))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let w = window_ms(window);
        let now = now_epoch_ms();
        let cur_key = self.bucket_key(key, bucket_of(now, w));

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(&cur_key)
            .cmd("PEXPIRE")
            .arg(&cur_key)
            .arg(w * 2)
            .ignore();

        let (count,): (i64,) = self.with_timeout(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn get_count(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let w = window_ms(window);
        let now = now_epoch_ms();
        let bucket = bucket_of(now, w);

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        cmd.arg(self.bucket_key(key, bucket))
            .arg(self.bucket_key(key, bucket - 1));

        let (cur, prev): (Option<i64>, Option<i64>) =
            self.with_timeout(cmd.query_async(&mut conn)).await?;
        Ok(weighted_estimate(
            prev.unwrap_or(0),
            cur.unwrap_or(0),
            elapsed_in_bucket(now, w),
            w,
        ))
    }

    async fn reset(&self, key: &str, window: Duration) -> Result<(), StoreError> {
        let w = window_ms(window);
        let bucket = bucket_of(now_epoch_ms(), w);

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.bucket_key(key, bucket))
            .arg(self.bucket_key(key, bucket - 1));

        let _: () = self.with_timeout(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let _: String = self.with_timeout(cmd.query_async(&mut conn)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_and_elapsed() {
        assert_eq!(bucket_of(0, 1000), 0);
        assert_eq!(bucket_of(999, 1000), 0);
        assert_eq!(bucket_of(1000, 1000), 1);
        assert_eq!(bucket_of(61_500, 60_000), 1);
        assert_eq!(elapsed_in_bucket(61_500, 60_000), 1500);
    }

    #[test]
    fn test_weighted_estimate_decays_previous_bucket() {
        // At the bucket boundary the previous bucket counts in full.
        assert_eq!(weighted_estimate(10, 0, 0, 1000), 10);
        // Halfway through, half of it.
        assert_eq!(weighted_estimate(10, 3, 500, 1000), 8);
        // At the end it has fully decayed.
        assert_eq!(weighted_estimate(10, 3, 999, 1000), 3);
    }

    #[test]
    fn test_decision_remaining_clamped() {
        let d = decision(true, 5, 2, 500, 1000);
        assert_eq!(d.count, 3);
        assert_eq!(d.remaining, 2);

        let d = decision(false, 5, 7, 500, 1000);
        assert_eq!(d.count, 7);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn test_reset_instant_is_next_bucket_boundary() {
        let d = decision(true, 5, 0, 61_500, 60_000);
        assert_eq!(d.reset_at.timestamp_millis(), 120_000);
    }
}
