use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one atomic compare-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    pub allowed: bool,
    /// Counter value after the operation.
    pub count: u32,
    /// Seconds until the counter expires.
    pub ttl_secs: u64,
}

/// Read-only view of a live counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u32,
    pub ttl_secs: u64,
}

/// Backend holding the per-identity vent counters.
///
/// `try_acquire` must be atomic: concurrent callers on the same key can
/// never push the counter past `limit`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &str;

    /// If the counter is below `limit`, increment it; otherwise leave it.
    /// A new counter expires after `window`; with `sliding` every accepted
    /// increment pushes the expiry back to `window`.
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        sliding: bool,
    ) -> Result<Acquire>;

    /// Current counter, or `None` if absent or expired.
    async fn peek(&self, key: &str) -> Result<Option<CounterState>>;

    /// Delete the counter. Returns whether one existed.
    async fn reset(&self, key: &str) -> Result<bool>;

    /// Connectivity probe for `/health`.
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

// ── In-memory store ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u32,
    expires_at: Instant,
}

/// Process-local counters. Correct for a single instance only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.lock();
        let before = map.len();
        map.retain(|_, entry| entry.expires_at > now);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every `interval` until the runtime shuts down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired rate-limit counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        sliding: bool,
    ) -> Result<Acquire> {
        let now = Instant::now();
        let window_end = now
            .checked_add(window)
            .context("rate-limit window does not fit in an Instant")?;
        let mut map = self.entries.lock();

        // Lazy eviction of this key
        if map.get(key).is_some_and(|e| e.expires_at <= now) {
            map.remove(key);
        }

        let entry = map.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: window_end,
        });

        if entry.count >= limit {
            return Ok(Acquire {
                allowed: false,
                count: entry.count,
                ttl_secs: ceil_secs(entry.expires_at.saturating_duration_since(now)),
            });
        }

        entry.count += 1;
        if sliding {
            entry.expires_at = window_end;
        }
        Ok(Acquire {
            allowed: true,
            count: entry.count,
            ttl_secs: ceil_secs(entry.expires_at.saturating_duration_since(now)),
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterState>> {
        let now = Instant::now();
        let map = self.entries.lock();
        Ok(map
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| CounterState {
                count: e.count,
                ttl_secs: ceil_secs(e.expires_at.saturating_duration_since(now)),
            }))
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ── Unavailable store ─────────────────────────────────────────────

/// Stands in for a cache that could not be reached at startup.
/// Every operation fails, leaving the decision to the fail mode.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CounterStore for UnavailableStore {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn try_acquire(&self, _: &str, _: u32, _: Duration, _: bool) -> Result<Acquire> {
        anyhow::bail!("cache unavailable: {}", self.reason)
    }

    async fn peek(&self, _: &str) -> Result<Option<CounterState>> {
        anyhow::bail!("cache unavailable: {}", self.reason)
    }

    async fn reset(&self, _: &str) -> Result<bool> {
        anyhow::bail!("cache unavailable: {}", self.reason)
    }

    async fn ping(&self) -> Result<()> {
        anyhow::bail!("cache unavailable: {}", self.reason)
    }
}
