use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

pub const COMPONENT_CACHE: &str = "cache";
pub const COMPONENT_LLM: &str = "llm";

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Healthy when both dependencies are ready, degraded when one is.
pub fn derive_status(cache_connected: bool, llm_configured: bool) -> Status {
    match (cache_connected, llm_configured) {
        (true, true) => Status::Healthy,
        (true, false) | (false, true) => Status::Degraded,
        (false, false) => Status::Unhealthy,
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Status,
    pub cache: &'static str,
    pub llm: &'static str,
    pub version: &'static str,
    pub environment: String,
    pub runtime: HealthSnapshot,
}

/// Last known state of each dependency, updated by probes and failures.
#[derive(Debug)]
pub struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            components: Mutex::new(BTreeMap::new()),
        }
    }

    fn upsert_component<F>(&self, component: &str, update: F)
    where
        F: FnOnce(&mut ComponentHealth),
    {
        let now = now_rfc3339();
        let mut map = self.components.lock();
        let entry = map
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                status: "starting".into(),
                updated_at: now.clone(),
                last_ok: None,
                last_error: None,
            });
        update(entry);
        entry.updated_at = now;
    }

    pub fn mark_component_ok(&self, component: &str) {
        self.upsert_component(component, |entry| {
            entry.status = "ok".into();
            entry.last_ok = Some(now_rfc3339());
            entry.last_error = None;
        });
    }

    pub fn mark_component_error(&self, component: &str, error: impl ToString) {
        let err = error.to_string();
        self.upsert_component(component, move |entry| {
            entry.status = "error".into();
            entry.last_error = Some(err);
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            pid: std::process::id(),
            updated_at: now_rfc3339(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components: self.components.lock().clone(),
        }
    }

    pub fn report(
        &self,
        cache_connected: bool,
        llm_configured: bool,
        environment: String,
    ) -> HealthReport {
        HealthReport {
            status: derive_status(cache_connected, llm_configured),
            cache: if cache_connected {
                "connected"
            } else {
                "disconnected"
            },
            llm: if llm_configured {
                "configured"
            } else {
                "not_configured"
            },
            version: crate::VERSION,
            environment,
            runtime: self.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table() {
        assert_eq!(derive_status(true, true), Status::Healthy);
        assert_eq!(derive_status(true, false), Status::Degraded);
        assert_eq!(derive_status(false, true), Status::Degraded);
        assert_eq!(derive_status(false, false), Status::Unhealthy);
    }

    #[test]
    fn error_then_ok_clears_last_error() {
        let registry = HealthRegistry::new();
        registry.mark_component_error(COMPONENT_CACHE, "connection refused");
        let snap = registry.snapshot();
        let cache = &snap.components[COMPONENT_CACHE];
        assert_eq!(cache.status, "error");
        assert_eq!(cache.last_error.as_deref(), Some("connection refused"));

        registry.mark_component_ok(COMPONENT_CACHE);
        let snap = registry.snapshot();
        let cache = &snap.components[COMPONENT_CACHE];
        assert_eq!(cache.status, "ok");
        assert!(cache.last_error.is_none());
        assert!(cache.last_ok.is_some());
    }

    #[test]
    fn report_serializes_flags() {
        let registry = HealthRegistry::new();
        let json = serde_json::to_value(registry.report(false, true, "production".into())).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["cache"], "disconnected");
        assert_eq!(json["llm"], "configured");
        assert_eq!(json["environment"], "production");
        assert_eq!(json["version"], crate::VERSION);
        assert!(json["runtime"]["uptime_seconds"].is_u64());
    }
}
