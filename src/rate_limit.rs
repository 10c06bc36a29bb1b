// ============================================================================
// Rate Limiting - Sliding-Window Admission Control
// ============================================================================
//
// Each key gets `points` admissions per `window_secs` window; one point per
// operation. The counter lives in a store shared by every gateway instance,
// so admission stays within budget across processes, not just threads.
//
// Store failure is fail-closed: an unreachable counter store rejects the
// request instead of admitting unlimited traffic.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::error::GatewayResult;

/// Admission key: caller network origin plus credential, or "anonymous".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(origin: &str, credential: Option<&str>) -> Self {
        RateLimitKey(format!(
            "rate:op:{}:{}",
            origin,
            credential.unwrap_or("anonymous")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        /// Points left in the current window (floored at zero).
        remaining: u32,
        /// Seconds until the window resets.
        reset_after: u64,
    },
    Rejected {
        /// Seconds until the window resets, rounded up.
        retry_after: u64,
    },
}

/// Shared counter store with atomic increment-with-expiry semantics.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key`, starting a `window_secs`
    /// expiry on the window's first hit. Returns the post-increment count and
    /// the seconds remaining until the window resets.
    async fn incr_with_window(&self, key: &str, window_secs: u64) -> GatewayResult<(u64, u64)>;
}

/// Redis-backed store. INCR + EXPIRE NX run in one MULTI/EXEC transaction so
/// concurrent gateway processes observe a single shared window.
pub struct RedisCounterStore {
    client: redis::aio::ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow::anyhow!("Failed to parse Redis URL: {}", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;
        Ok(Self { client: conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_window(&self, key: &str, window_secs: u64) -> GatewayResult<(u64, u64)> {
        let mut conn = self.client.clone();
        let (count, _expire_set, ttl): (u64, i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(window_secs)
            .arg("NX")
            .cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        // TTL can report -1 if the key predates EXPIRE support for NX;
        // treat that as a full window rather than a stuck counter.
        let reset_after = if ttl > 0 { ttl as u64 } else { window_secs };
        Ok((count, reset_after))
    }
}

/// In-process store for tests and single-node development.
#[derive(Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_window(&self, key: &str, window_secs: u64) -> GatewayResult<(u64, u64)> {
        let window = Duration::from_secs(window_secs);
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let entry = windows.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= window {
            *entry = (0, now);
        }
        entry.0 += 1;

        let elapsed = now.duration_since(entry.1);
        let reset_after = window.saturating_sub(elapsed).as_secs_f64().ceil() as u64;
        Ok((entry.0, reset_after.max(1)))
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    points: u32,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            points: config.points,
            window_secs: config.window_secs,
        }
    }

    /// Consume one point for `key`.
    ///
    /// Fail-closed: a store error propagates as an internal error and the
    /// request is not admitted.
    pub async fn admit(&self, key: &RateLimitKey) -> GatewayResult<Admission> {
        let (count, reset_after) = self
            .store
            .incr_with_window(key.as_str(), self.window_secs)
            .await?;

        if count <= u64::from(self.points) {
            Ok(Admission::Admitted {
                remaining: self.points.saturating_sub(count as u32),
                reset_after,
            })
        } else {
            tracing::debug!(key = %key.as_str(), count, "Rate limit exceeded");
            Ok(Admission::Rejected {
                retry_after: reset_after,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn limiter(points: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            &RateLimitConfig {
                points,
                window_secs,
            },
        )
    }

    #[tokio::test]
    async fn admits_within_budget_and_counts_down() {
        let limiter = limiter(3, 60);
        let key = RateLimitKey::new("10.0.0.1", Some("token-a"));

        for expected_remaining in [2u32, 1, 0] {
            match limiter.admit(&key).await.unwrap() {
                Admission::Admitted { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("expected admission, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn rejects_beyond_budget_with_retry_after() {
        let limiter = limiter(100, 60);
        let key = RateLimitKey::new("10.0.0.1", Some("token-a"));

        for _ in 0..100 {
            assert!(matches!(
                limiter.admit(&key).await.unwrap(),
                Admission::Admitted { .. }
            ));
        }

        // The 101st request within the window is rejected.
        match limiter.admit(&key).await.unwrap() {
            Admission::Rejected { retry_after } => {
                assert!(retry_after >= 1 && retry_after <= 60);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_windows() {
        let limiter = limiter(1, 60);
        let a = RateLimitKey::new("10.0.0.1", Some("token-a"));
        let b = RateLimitKey::new("10.0.0.2", Some("token-a"));
        let anon = RateLimitKey::new("10.0.0.1", None);

        assert!(matches!(
            limiter.admit(&a).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            limiter.admit(&b).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            limiter.admit(&anon).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            limiter.admit(&a).await.unwrap(),
            Admission::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_burst_never_exceeds_budget() {
        let budget = 25u32;
        let limiter = Arc::new(limiter(budget, 60));
        let key = RateLimitKey::new("10.0.0.1", Some("token-a"));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            let key = key.clone();
            handles.push(tokio::spawn(
                async move { limiter.admit(&key).await.unwrap() },
            ));
        }

        let mut admitted = 0u32;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Admitted { .. }) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, budget);
    }

    #[tokio::test]
    async fn window_reset_restores_budget() {
        let limiter = limiter(1, 1);
        let key = RateLimitKey::new("10.0.0.1", None);

        assert!(matches!(
            limiter.admit(&key).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            limiter.admit(&key).await.unwrap(),
            Admission::Rejected { .. }
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(
            limiter.admit(&key).await.unwrap(),
            Admission::Admitted { .. }
        ));
    }
}
