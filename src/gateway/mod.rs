//! HTTP gateway: the axum router, vent handler and server loop.
//!
//! `POST /api/vent` runs the pipeline in order: body validation, rate-limit
//! check, PII scrub, upstream stream, SSE framing. Nothing about the vent is
//! persisted; only counters and anonymous aggregates outlive the request.

pub mod sse;

use crate::analytics::{detect_emotion, AggregateStats, Analytics, VentRecord, DEFAULT_PERIOD_DAYS};
use crate::config::{Config, GatewayConfig};
use crate::error::ApiError;
use crate::health::{HealthRegistry, HealthReport, COMPONENT_CACHE, COMPONENT_LLM};
use crate::providers::{self, Provider};
use crate::ratelimit::{self, CounterStore, Identity, RateLimiter, Tier, UsageSnapshot};
use crate::security::redact;
use crate::vent::{build_chat_request, relay_frames, RelaySummary, VentRequest};
use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Local, Timelike, Utc};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const REMAINING_VENTS_HEADER: &str = "x-remaining-vents";
pub const RESET_SECONDS_HEADER: &str = "x-reset-seconds";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub provider: Arc<dyn Provider>,
    pub analytics: Arc<Analytics>,
    pub health: Arc<HealthRegistry>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn CounterStore>, provider: Arc<dyn Provider>) -> Self {
        let limiter = RateLimiter::new(store, &config.rate_limit);
        Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            provider,
            analytics: Arc::new(Analytics::new()),
            health: Arc::new(HealthRegistry::new()),
        }
    }

    /// Open the configured counter store and LLM provider.
    pub async fn from_config(config: Config) -> Self {
        let store = ratelimit::open_store(&config.cache).await;
        let provider = providers::create_provider(&config.llm);
        Self::new(config, store, provider)
    }

    async fn probe_cache(&self) -> bool {
        match self.limiter.store().ping().await {
            Ok(()) => {
                self.health.mark_component_ok(COMPONENT_CACHE);
                true
            }
            Err(e) => {
                self.health.mark_component_error(COMPONENT_CACHE, format!("{e:#}"));
                false
            }
        }
    }

    fn probe_llm(&self) -> bool {
        let configured = self.provider.is_configured();
        if configured {
            self.health.mark_component_ok(COMPONENT_LLM);
        } else {
            self.health
                .mark_component_error(COMPONENT_LLM, "no API key configured");
        }
        configured
    }
}

/// Who is calling, resolved from the socket peer and (when trusted) proxy
/// headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub Identity);

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self(resolve_identity(
            &parts.headers,
            peer,
            &state.config.gateway,
        )))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client IP: first `X-Forwarded-For` hop when proxy headers are trusted,
/// else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

pub fn resolve_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    gateway: &GatewayConfig,
) -> Identity {
    if gateway.trust_identity_headers {
        if let Some(user_id) = header_str(headers, USER_ID_HEADER) {
            let tier = header_str(headers, USER_TIER_HEADER).and_then(|t| t.parse::<Tier>().ok());
            return Identity::user(user_id, tier);
        }
    }

    let ip = client_ip(headers, peer, gateway.trust_proxy_headers);
    let user_agent = header_str(headers, header::USER_AGENT.as_str()).unwrap_or("");
    Identity::anonymous(&ip, user_agent)
}

/// Echo a client-supplied session id if it is a UUID, else issue a new one.
pub fn session_id(headers: &HeaderMap) -> Uuid {
    header_str(headers, SESSION_ID_HEADER)
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(REMAINING_VENTS_HEADER),
            HeaderName::from_static(RESET_SECONDS_HEADER),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.gateway.cors_origins);
    let body_limit = state.config.gateway.max_body_bytes;

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/vent", post(handle_vent))
        .route("/api/usage", get(handle_usage))
        .route("/api/analytics/aggregate", get(handle_aggregate))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Bind, serve until Ctrl+C / SIGTERM, then drain in-flight requests.
pub async fn run_gateway(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind gateway to {addr}"))?;
    let local_addr = listener.local_addr()?;

    let state = AppState::from_config(config).await;
    if let Err(e) = state.provider.warmup().await {
        tracing::warn!(provider = state.provider.name(), "Provider warmup failed: {e:#}");
    }
    let cache_ok = state.probe_cache().await;
    let llm_ok = state.probe_llm();

    tracing::info!(
        addr = %local_addr,
        environment = %state.config.environment,
        provider = state.provider.name(),
        store = state.limiter.store().name(),
        cache_ok,
        llm_ok,
        "VentVault gateway listening"
    );
    println!("VentVault gateway listening on http://{local_addr}");
    println!("  POST /api/vent                  {{\"mode\": \"text\", \"content\": \"...\"}}");
    println!("  GET  /api/usage                 remaining vents");
    println!("  GET  /api/analytics/aggregate   anonymous aggregates (?days=N)");
    println!("  GET  /health                    health check");
    println!("  Press Ctrl+C to stop.\n");

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("gateway server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}

// ── Handlers ──────────────────────────────────────────────────────

async fn handle_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "VentVault API",
        "version": crate::VERSION,
    }))
}

/// GET /health: always public, reports dependency readiness
async fn handle_health(State(state): State<AppState>) -> Json<HealthReport> {
    let cache_connected = state.probe_cache().await;
    let llm_configured = state.probe_llm();
    Json(state.health.report(
        cache_connected,
        llm_configured,
        state.config.environment.to_string(),
    ))
}

/// POST /api/vent: stream a reply as SSE
async fn handle_vent(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    headers: HeaderMap,
    payload: Result<Json<VentRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let vent = request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let decision = match state.limiter.check_limit(&identity).await {
        Ok(decision) => decision,
        Err(e) => {
            state
                .health
                .mark_component_error(COMPONENT_CACHE, format!("{e:#}"));
            return Err(ApiError::CacheUnavailable);
        }
    };
    if decision.degraded {
        state
            .health
            .mark_component_error(COMPONENT_CACHE, "counter store unavailable");
    }
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after: decision.reset_seconds,
        });
    }

    let continued_conversation = !vent.history.is_empty();
    let scrubbed = vent.scrub();
    if scrubbed.pii_detected() {
        tracing::info!(kinds = ?scrubbed.pii_kinds, "Scrubbed PII from vent");
    }

    let chat = build_chat_request(&scrubbed, &state.config.llm, Local::now().hour());
    let started = Instant::now();
    let rx = providers::spawn_stream(Arc::clone(&state.provider), chat);

    let (emotion, intensity) = detect_emotion(&scrubbed.content);
    let analytics = Arc::clone(&state.analytics);
    let identity_key = identity.key();
    let mode = scrubbed.mode;
    let word_count = scrubbed.word_count();
    let pii_detected = scrubbed.pii_detected();
    let remaining = decision.remaining;

    let on_complete = move |summary: RelaySummary| {
        let latency_ms = u64::try_from(summary.latency.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            key = %redact(&identity_key),
            outcome = summary.outcome.as_str(),
            latency_ms,
            tokens = summary.tokens,
            fallback = summary.fallback_used,
            remaining,
            "Vent completed"
        );
        analytics.record(VentRecord {
            at: Utc::now(),
            identity_key,
            mode,
            word_count,
            emotion,
            intensity,
            latency_ms,
            tokens: summary.tokens,
            pii_detected,
            continued_conversation,
            outcome: summary.outcome,
        });
    };

    let frames = relay_frames(rx, started, on_complete);
    let mut response = sse::vent_stream(frames).into_response();

    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&session_id(&headers).to_string()) {
        response_headers.insert(SESSION_ID_HEADER, value);
    }
    response_headers.insert(REMAINING_VENTS_HEADER, HeaderValue::from(decision.remaining));
    response_headers.insert(RESET_SECONDS_HEADER, HeaderValue::from(decision.reset_seconds));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    Ok(response)
}

/// GET /api/usage: current allowance without consuming a vent
async fn handle_usage(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
) -> Result<Json<UsageSnapshot>, ApiError> {
    match state.limiter.usage(&identity).await {
        Ok(usage) => Ok(Json(usage)),
        Err(e) => {
            state
                .health
                .mark_component_error(COMPONENT_CACHE, format!("{e:#}"));
            Err(ApiError::CacheUnavailable)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    pub days: Option<u32>,
}

/// GET /api/analytics/aggregate: anonymous aggregates, no content
async fn handle_aggregate(
    State(state): State<AppState>,
    Query(query): Query<AggregateQuery>,
) -> Json<AggregateStats> {
    Json(
        state
            .analytics
            .aggregate(query.days.unwrap_or(DEFAULT_PERIOD_DAYS)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(trust_proxy: bool, trust_identity: bool) -> GatewayConfig {
        GatewayConfig {
            trust_proxy_headers: trust_proxy,
            trust_identity_headers: trust_identity,
            ..GatewayConfig::default()
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("203.0.113.7:51234".parse().unwrap())
    }

    #[test]
    fn client_ip_ignores_forwarded_for_unless_trusted() {
        let h = headers(&[("x-forwarded-for", "198.51.100.1, 10.0.0.1")]);
        assert_eq!(client_ip(&h, peer(), false), "203.0.113.7");
        assert_eq!(client_ip(&h, peer(), true), "198.51.100.1");
    }

    #[test]
    fn client_ip_falls_back_to_unknown() {
        assert_eq!(client_ip(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn anonymous_identity_hashes_ip_and_user_agent() {
        let h = headers(&[("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")]);
        let identity = resolve_identity(&h, peer(), &gateway(false, false));
        assert_eq!(identity, Identity::anonymous("203.0.113.7", "Mozilla/5.0 (X11; Linux x86_64)"));
        assert_eq!(identity.key(), "rate:anonymous:10a199c1ad46aef7");
    }

    #[test]
    fn identity_headers_need_trust() {
        let h = headers(&[("x-user-id", "user-42"), ("x-user-tier", "premium")]);

        let untrusted = resolve_identity(&h, peer(), &gateway(false, false));
        assert_eq!(untrusted.tier(), Tier::Anonymous);

        let trusted = resolve_identity(&h, peer(), &gateway(false, true));
        assert_eq!(trusted.key(), "rate:premium:user-42");
    }

    #[test]
    fn unknown_tier_header_defaults_to_signed_in() {
        let h = headers(&[("x-user-id", "user-42"), ("x-user-tier", "platinum")]);
        let identity = resolve_identity(&h, None, &gateway(false, true));
        assert_eq!(identity.tier(), Tier::SignedIn);
    }

    #[test]
    fn session_id_echoes_valid_uuid_only() {
        let id = "6f1c2b8e-3d4a-4e5f-9a7b-1c2d3e4f5a6b";
        let h = headers(&[("x-session-id", "6f1c2b8e-3d4a-4e5f-9a7b-1c2d3e4f5a6b")]);
        assert_eq!(session_id(&h).to_string(), id);

        let bogus = headers(&[("x-session-id", "not-a-uuid")]);
        assert_ne!(session_id(&bogus).to_string(), "not-a-uuid");
    }
}
