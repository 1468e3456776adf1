use crate::chain::ChainReader;
use crate::errors::{GatewayError, Result};
use crate::kv::{KvTransaction, RedisPool};
use crate::models::{CapacityInfo, CapacitySnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub mod keys {
    pub const PENDING_MINT: &str = "pending_mint";
}

/// Safety ceiling on a pending reservation. A missed release leaks at
/// most this long.
pub const PENDING_TTL_SECS: u64 = 3600;

/// Freshness window for the mutable on-chain mint counter.
pub const MINT_COUNT_TTL: Duration = Duration::from_secs(6);

/// Permanent cache of `maxMintCount()`. The value is a contract constant,
/// so a populated entry is never refreshed.
pub struct MaxMintCountCache {
    inner: RwLock<HashMap<String, u64>>,
    chain: Arc<dyn ChainReader>,
}

impl MaxMintCountCache {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            chain,
        }
    }

    pub async fn get(&self, token: &str) -> Result<u64> {
        if let Some(value) = self.inner.read().await.get(token) {
            return Ok(*value);
        }
        let value = self
            .chain
            .max_mint_count(token)
            .await
            .map_err(|e| GatewayError::CapacityCheckFailed(e.to_string()))?;
        self.inner.write().await.insert(token.to_string(), value);
        debug!("Cached maxMintCount for {}: {}", token, value);
        Ok(value)
    }

    /// Test hook only; production entries never expire.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

/// Short-lived cache of `mintCount()`. A stale value is served as a
/// degraded-mode read when the refresh fails.
pub struct MintCountCache {
    inner: RwLock<HashMap<String, (u64, Instant)>>,
    chain: Arc<dyn ChainReader>,
    ttl: Duration,
}

impl MintCountCache {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self::with_ttl(chain, MINT_COUNT_TTL)
    }

    pub fn with_ttl(chain: Arc<dyn ChainReader>, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            chain,
            ttl,
        }
    }

    pub async fn get(&self, token: &str) -> Result<u64> {
        if let Some((value, fetched_at)) = self.inner.read().await.get(token) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(*value);
            }
        }

        match self.chain.mint_count(token).await {
            Ok(value) => {
                self.inner
                    .write()
                    .await
                    .insert(token.to_string(), (value, Instant::now()));
                Ok(value)
            }
            Err(e) => {
                if let Some((stale, _)) = self.inner.read().await.get(token) {
                    warn!(
                        "mintCount refresh failed for {}, serving stale {}: {}",
                        token, stale, e
                    );
                    return Ok(*stale);
                }
                Err(GatewayError::CapacityCheckFailed(e.to_string()))
            }
        }
    }
}

/// Redis counter of in-flight reservations per token. Advisory only: it
/// may drift when a process dies between reserve and release, and the
/// TTL bounds how long that drift survives.
pub struct PendingMintCounter {
    pool: Arc<RedisPool>,
}

impl PendingMintCounter {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    fn key(token: &str) -> String {
        format!("{}:{}", keys::PENDING_MINT, token.to_lowercase())
    }

    pub async fn increment(&self, token: &str, n: u64) -> Result<()> {
        let key = Self::key(token);
        let tx = KvTransaction::new()
            .command("INCRBY", [key.clone(), n.to_string()])
            .command("EXPIRE", [key, PENDING_TTL_SECS.to_string()]);
        self.pool.commit(tx).await
    }

    pub async fn decrement(&self, token: &str, n: u64) -> Result<()> {
        let key = Self::key(token);
        let remaining: i64 = {
            let mut cmd = redis::cmd("DECRBY");
            cmd.arg(&key).arg(n);
            self.pool.execute(cmd).await?
        };
        if remaining <= 0 {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(&key);
            let _: i64 = self.pool.execute(cmd).await?;
        }
        Ok(())
    }

    pub async fn get(&self, token: &str) -> Result<u64> {
        let value: Option<i64> = {
            let mut cmd = redis::cmd("GET");
            cmd.arg(Self::key(token));
            self.pool.execute(cmd).await?
        };
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    pub async fn clear(&self, token: &str) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(Self::key(token));
        let _: i64 = self.pool.execute(cmd).await?;
        Ok(())
    }
}

/// Pure admission arithmetic, shared by the check path and its tests.
pub fn evaluate(max: u64, current: u64, pending: u64, requested: u64) -> Result<CapacityInfo> {
    let used = current.saturating_add(pending);
    let available = max.saturating_sub(used);
    if used.saturating_add(requested) > max {
        return Err(GatewayError::CapacityExceeded { available });
    }
    Ok(CapacityInfo {
        max,
        current,
        pending,
        available,
    })
}

/// Combines the immutable max, the 6-second on-chain counter, and the
/// Redis pending counter into admission decisions and soft reservations.
/// Check-then-reserve is deliberately not atomic; the facilitator owns
/// the hard on-chain bound.
pub struct CapacityManager {
    max_cache: MaxMintCountCache,
    count_cache: MintCountCache,
    pending: PendingMintCounter,
}

impl CapacityManager {
    pub fn new(chain: Arc<dyn ChainReader>, pool: Arc<RedisPool>) -> Self {
        Self {
            max_cache: MaxMintCountCache::new(chain.clone()),
            count_cache: MintCountCache::new(chain),
            pending: PendingMintCounter::new(pool),
        }
    }

    pub async fn check(&self, token: &str, requested: u64) -> Result<CapacityInfo> {
        let max = self.max_cache.get(token).await?;
        let current = self.count_cache.get(token).await?;
        let pending = self
            .pending
            .get(token)
            .await
            .map_err(|e| GatewayError::CapacityCheckFailed(e.to_string()))?;
        evaluate(max, current, pending, requested)
    }

    pub async fn reserve(&self, token: &str, n: u64) -> Result<()> {
        self.pending.increment(token, n).await
    }

    pub async fn release(&self, token: &str, n: u64) -> Result<()> {
        self.pending.decrement(token, n).await
    }

    pub async fn snapshot(&self, token: &str) -> Result<CapacitySnapshot> {
        let max = self.max_cache.get(token).await?;
        let current = self.count_cache.get(token).await?;
        let pending = self
            .pending
            .get(token)
            .await
            .map_err(|e| GatewayError::CapacityCheckFailed(e.to_string()))?;
        let available = max.saturating_sub(current.saturating_add(pending));
        let percentage = if max == 0 {
            0.0
        } else {
            (available as f64 / max as f64) * 100.0
        };
        Ok(CapacitySnapshot {
            max,
            current,
            pending,
            available,
            percentage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct MockChain {
        max_calls: AtomicU64,
        count_calls: AtomicU64,
        mint_count: AtomicU64,
        fail_counts: std::sync::atomic::AtomicBool,
    }

    impl MockChain {
        fn new(mint_count: u64) -> Self {
            Self {
                max_calls: AtomicU64::new(0),
                count_calls: AtomicU64::new(0),
                mint_count: AtomicU64::new(mint_count),
                fail_counts: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChainReader for MockChain {
        async fn max_mint_count(&self, _token: &str) -> Result<u64> {
            self.max_calls.fetch_add(1, Ordering::SeqCst);
            Ok(100)
        }

        async fn mint_count(&self, _token: &str) -> Result<u64> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_counts.load(Ordering::SeqCst) {
                return Err(GatewayError::ChainRead("rpc unreachable".to_string()));
            }
            Ok(self.mint_count.load(Ordering::SeqCst))
        }

        async fn deployment_deadline(&self, _token: &str) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_max_mint_count_read_once() {
        let chain = Arc::new(MockChain::new(0));
        let cache = MaxMintCountCache::new(chain.clone());

        for _ in 0..5 {
            assert_eq!(cache.get("0xaa").await.unwrap(), 100);
        }
        assert_eq!(chain.max_calls.load(Ordering::SeqCst), 1);

        cache.clear().await;
        assert_eq!(cache.get("0xaa").await.unwrap(), 100);
        assert_eq!(chain.max_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mint_count_fetched_once_per_window() {
        let chain = Arc::new(MockChain::new(42));
        let cache = MintCountCache::with_ttl(chain.clone(), Duration::from_millis(80));

        for _ in 0..10 {
            assert_eq!(cache.get("0xaa").await.unwrap(), 42);
        }
        assert_eq!(chain.count_calls.load(Ordering::SeqCst), 1);

        chain.mint_count.store(43, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get("0xaa").await.unwrap(), 43);
        assert_eq!(chain.count_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mint_count_serves_stale_on_read_failure() {
        let chain = Arc::new(MockChain::new(42));
        let cache = MintCountCache::with_ttl(chain.clone(), Duration::from_millis(20));

        assert_eq!(cache.get("0xaa").await.unwrap(), 42);

        chain.fail_counts.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Refresh fails; the stale value is the degraded-mode answer.
        assert_eq!(cache.get("0xaa").await.unwrap(), 42);

        // With no stale entry at all, the failure propagates.
        let err = cache.get("0xbb").await.unwrap_err();
        assert!(matches!(err, GatewayError::CapacityCheckFailed(_)));
    }

    #[test]
    fn test_evaluate_rejects_over_capacity() {
        // max=100, current=95, pending=3, requesting 5 → only 2 available.
        let err = evaluate(100, 95, 3, 5).unwrap_err();
        match err {
            GatewayError::CapacityExceeded { available } => assert_eq!(available, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_evaluate_admits_exact_fit() {
        let info = evaluate(100, 95, 3, 2).unwrap();
        assert_eq!(info.available, 2);
        assert_eq!(info.max, 100);
        assert_eq!(info.pending, 3);
    }

    #[test]
    fn test_evaluate_saturates_on_drifted_counters() {
        // Pending drift can push used past max; available clamps to 0.
        let err = evaluate(100, 99, 10, 1).unwrap_err();
        match err {
            GatewayError::CapacityExceeded { available } => assert_eq!(available, 0),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
