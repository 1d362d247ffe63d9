//! Tiered daily vent limits.
//!
//! Each identity gets one counter in a [`CounterStore`]; the store performs
//! the compare-and-increment atomically, so this layer only maps identities
//! to keys and limits and decides what a store failure means.

pub mod identity;
#[cfg(feature = "cache-redis")]
pub mod redis_store;
pub mod store;

pub use identity::{device_hash, Identity, Tier};
#[cfg(feature = "cache-redis")]
pub use redis_store::RedisStore;
pub use store::{Acquire, CounterState, CounterStore, MemoryStore, UnavailableStore};

use crate::config::{CacheBackend, CacheConfig, FailMode, RateLimitConfig, WindowMode};
use crate::security::redact;
use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of [`RateLimiter::check_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_seconds: u64,
    pub limit: u32,
    pub tier: Tier,
    /// The store failed and the fail-open path produced this decision.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
    pub tier: Tier,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    anon_limit: u32,
    signed_in_limit: u32,
    premium_limit: u32,
    window: Duration,
    window_mode: WindowMode,
    fail_mode: FailMode,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            anon_limit: config.anon_daily_limit,
            signed_in_limit: config.signed_in_daily_limit,
            premium_limit: config.premium_daily_limit,
            window: Duration::from_secs(config.window_secs),
            window_mode: config.window_mode,
            fail_mode: config.fail_mode,
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    pub fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Anonymous => self.anon_limit,
            Tier::SignedIn => self.signed_in_limit,
            Tier::Premium => self.premium_limit,
        }
    }

    pub fn key_and_limit(&self, identity: &Identity) -> (String, u32) {
        (identity.key(), self.limit_for(identity.tier()))
    }

    /// Count one vent against `identity`.
    ///
    /// Errors only when the store fails and the fail mode is `closed`.
    pub async fn check_limit(&self, identity: &Identity) -> Result<Decision> {
        let (key, limit) = self.key_and_limit(identity);
        let tier = identity.tier();
        let sliding = self.window_mode == WindowMode::Sliding;

        match self
            .store
            .try_acquire(&key, limit, self.window, sliding)
            .await
        {
            Ok(acquire) if acquire.allowed => Ok(Decision {
                allowed: true,
                remaining: limit.saturating_sub(acquire.count),
                reset_seconds: acquire.ttl_secs,
                limit,
                tier,
                degraded: false,
            }),
            Ok(acquire) => {
                tracing::info!(key = %redact(&key), "Rate limit exceeded");
                Ok(Decision {
                    allowed: false,
                    remaining: 0,
                    reset_seconds: acquire.ttl_secs,
                    limit,
                    tier,
                    degraded: false,
                })
            }
            Err(e) => match self.fail_mode {
                FailMode::Open => {
                    tracing::error!(store = self.store.name(), "Rate limiter store error, failing open: {e:#}");
                    Ok(Decision {
                        allowed: true,
                        remaining: limit.saturating_sub(1),
                        reset_seconds: self.window_secs(),
                        limit,
                        tier,
                        degraded: true,
                    })
                }
                FailMode::Closed => {
                    tracing::error!(store = self.store.name(), "Rate limiter store error, failing closed: {e:#}");
                    Err(e)
                }
            },
        }
    }

    /// Usage for `identity` without consuming a vent.
    pub async fn usage(&self, identity: &Identity) -> Result<UsageSnapshot> {
        let (key, limit) = self.key_and_limit(identity);
        let tier = identity.tier();

        match self.store.peek(&key).await {
            Ok(Some(state)) => Ok(UsageSnapshot {
                used: state.count,
                limit,
                remaining: limit.saturating_sub(state.count),
                reset_seconds: if state.ttl_secs > 0 {
                    state.ttl_secs
                } else {
                    self.window_secs()
                },
                tier,
            }),
            Ok(None) => Ok(self.fresh_usage(limit, tier)),
            Err(e) if self.fail_mode == FailMode::Open => {
                tracing::error!("Rate limiter store error reading usage: {e:#}");
                Ok(self.fresh_usage(limit, tier))
            }
            Err(e) => Err(e),
        }
    }

    /// Admin reset. Returns `true` when the store accepted the delete.
    pub async fn reset(&self, identity: &Identity) -> bool {
        let key = identity.key();
        match self.store.reset(&key).await {
            Ok(existed) => {
                tracing::info!(key = %redact(&key), existed, "Rate limit reset");
                true
            }
            Err(e) => {
                tracing::error!("Rate limiter store error resetting limit: {e:#}");
                false
            }
        }
    }

    fn fresh_usage(&self, limit: u32, tier: Tier) -> UsageSnapshot {
        UsageSnapshot {
            used: 0,
            limit,
            remaining: limit,
            reset_seconds: self.window_secs(),
            tier,
        }
    }
}

/// Build the configured counter store. Connection failures degrade to
/// [`UnavailableStore`] so the gateway still starts.
pub async fn open_store(config: &CacheConfig) -> Arc<dyn CounterStore> {
    match config.backend {
        CacheBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            store
        }
        CacheBackend::Redis => open_redis(&config.redis_url).await,
    }
}

/// Clear one identity's counter from outside the gateway process.
///
/// Only a shared backend can be reset this way: memory counters belong to
/// the running gateway, so a fresh in-process store would report a reset
/// that never touched them.
pub async fn reset_limit(
    cache: &CacheConfig,
    rate_limit: &RateLimitConfig,
    identity: &Identity,
) -> Result<()> {
    if cache.backend == CacheBackend::Memory {
        bail!(
            "reset-limit needs cache.backend = \"redis\"; memory counters live inside the running gateway"
        );
    }
    let limiter = RateLimiter::new(open_store(cache).await, rate_limit);
    if !limiter.reset(identity).await {
        bail!("Failed to reset limit for {}", redact(&identity.key()));
    }
    Ok(())
}

#[cfg(feature = "cache-redis")]
async fn open_redis(url: &str) -> Arc<dyn CounterStore> {
    let connect = tokio::time::timeout(Duration::from_secs(5), RedisStore::connect(url)).await;
    match connect {
        Ok(Ok(store)) => {
            tracing::info!("Connected to redis");
            Arc::new(store)
        }
        Ok(Err(e)) => {
            tracing::error!("Redis connection failed: {e:#}");
            Arc::new(UnavailableStore::new(format!("{e:#}")))
        }
        Err(_) => {
            tracing::error!("Redis connection timed out");
            Arc::new(UnavailableStore::new("connection timed out"))
        }
    }
}

#[cfg(not(feature = "cache-redis"))]
async fn open_redis(_url: &str) -> Arc<dyn CounterStore> {
    tracing::error!("cache.backend = \"redis\" but this build lacks the cache-redis feature");
    Arc::new(UnavailableStore::new("built without cache-redis"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(store: Arc<dyn CounterStore>, fail_mode: FailMode) -> RateLimiter {
        let config = RateLimitConfig {
            anon_daily_limit: 2,
            signed_in_daily_limit: 3,
            premium_daily_limit: 5,
            fail_mode,
            ..RateLimitConfig::default()
        };
        RateLimiter::new(store, &config)
    }

    fn anon() -> Identity {
        Identity::anonymous("198.51.100.4", "test-agent")
    }

    #[tokio::test]
    async fn remaining_counts_down_then_rejects() {
        let rl = limiter(Arc::new(MemoryStore::new()), FailMode::Open);

        let first = rl.check_limit(&anon()).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.limit, 2);
        assert_eq!(first.tier, Tier::Anonymous);

        let second = rl.check_limit(&anon()).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = rl.check_limit(&anon()).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(third.reset_seconds > 0);
        assert!(!third.degraded);
    }

    #[tokio::test]
    async fn tiers_have_separate_limits_and_counters() {
        let rl = limiter(Arc::new(MemoryStore::new()), FailMode::Open);
        let user = Identity::user("u-1", None);
        let premium = Identity::user("u-1", Some(Tier::Premium));

        for _ in 0..3 {
            assert!(rl.check_limit(&user).await.unwrap().allowed);
        }
        assert!(!rl.check_limit(&user).await.unwrap().allowed);

        let p = rl.check_limit(&premium).await.unwrap();
        assert!(p.allowed);
        assert_eq!(p.remaining, 4);
        assert!(rl.check_limit(&anon()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn usage_does_not_consume() {
        let rl = limiter(Arc::new(MemoryStore::new()), FailMode::Open);
        let fresh = rl.usage(&anon()).await.unwrap();
        assert_eq!(fresh.used, 0);
        assert_eq!(fresh.remaining, 2);
        assert_eq!(fresh.reset_seconds, 86_400);

        rl.check_limit(&anon()).await.unwrap();
        let after = rl.usage(&anon()).await.unwrap();
        assert_eq!(after.used, 1);
        assert_eq!(after.remaining, 1);
        assert_eq!(rl.usage(&anon()).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn reset_restores_allowance() {
        let rl = limiter(Arc::new(MemoryStore::new()), FailMode::Open);
        rl.check_limit(&anon()).await.unwrap();
        rl.check_limit(&anon()).await.unwrap();
        assert!(!rl.check_limit(&anon()).await.unwrap().allowed);

        assert!(rl.reset(&anon()).await);
        assert!(rl.check_limit(&anon()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn store_failure_fails_open_by_default() {
        let rl = limiter(Arc::new(UnavailableStore::new("down")), FailMode::Open);
        let d = rl.check_limit(&anon()).await.unwrap();
        assert!(d.allowed);
        assert!(d.degraded);
        assert_eq!(d.remaining, 1);
        assert_eq!(d.reset_seconds, 86_400);

        let usage = rl.usage(&anon()).await.unwrap();
        assert_eq!(usage.remaining, 2);
        assert!(!rl.reset(&anon()).await);
    }

    #[tokio::test]
    async fn store_failure_fails_closed_when_configured() {
        let rl = limiter(Arc::new(UnavailableStore::new("down")), FailMode::Closed);
        assert!(rl.check_limit(&anon()).await.is_err());
        assert!(rl.usage(&anon()).await.is_err());
    }

    #[tokio::test]
    async fn reset_limit_refuses_memory_backend() {
        let err = reset_limit(
            &CacheConfig::default(),
            &RateLimitConfig::default(),
            &anon(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("redis"), "got: {err}");
    }

    #[tokio::test]
    async fn reset_limit_reports_unreachable_redis() {
        let cache = CacheConfig {
            backend: CacheBackend::Redis,
            redis_url: "redis://127.0.0.1:1".into(),
            ..CacheConfig::default()
        };
        let result = reset_limit(&cache, &RateLimitConfig::default(), &anon()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn memory_backend_opens_without_network() {
        let store = open_store(&CacheConfig::default()).await;
        assert_eq!(store.name(), "memory");
        assert!(store.ping().await.is_ok());
    }
}
