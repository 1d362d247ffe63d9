//! Service endpoints around the vent path: root, health, usage, aggregates
//! and CORS.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use serde_json::json;
use std::sync::Arc;
use ventvault::config::Config;
use ventvault::providers::FallbackProvider;
use ventvault::ratelimit::{MemoryStore, UnavailableStore};

#[tokio::test]
async fn root_identifies_the_service() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    let json = body_json(send(&app, get("/")).await).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "VentVault API");
    assert_eq!(json["version"], ventvault::VERSION);
}

#[tokio::test]
async fn health_is_healthy_with_store_and_llm() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    let response = send(&app, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["cache"], "connected");
    assert_eq!(json["llm"], "configured");
    assert_eq!(json["environment"], "development");
    assert_eq!(json["runtime"]["components"]["cache"]["status"], "ok");
}

#[tokio::test]
async fn health_is_degraded_when_cache_is_down() {
    let (app, _) = app_with(
        Config::default(),
        Arc::new(UnavailableStore::new("redis down")),
        ScriptedProvider::replying(&["ok"]),
    );
    let json = body_json(send(&app, get("/health")).await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["cache"], "disconnected");
    assert_eq!(json["runtime"]["components"]["cache"]["status"], "error");
}

#[tokio::test]
async fn health_is_degraded_without_llm_key() {
    let (app, _) = app_with(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(FallbackProvider),
    );
    let json = body_json(send(&app, get("/health")).await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["llm"], "not_configured");
}

#[tokio::test]
async fn health_is_unhealthy_when_nothing_is_ready() {
    let (app, _) = app_with(
        Config::default(),
        Arc::new(UnavailableStore::new("redis down")),
        Arc::new(FallbackProvider),
    );
    let json = body_json(send(&app, get("/health")).await).await;
    assert_eq!(json["status"], "unhealthy");
}

#[tokio::test]
async fn fallback_provider_still_answers_vents() {
    let (app, _) = app_with(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(FallbackProvider),
    );
    let body = body_string(send(&app, vent_request(&json!({"content": "hi"}), "ua")).await).await;
    assert_eq!(
        sse_events(&body),
        vec![ventvault::providers::COMFORT_REPLY, "[DONE]"]
    );
}

fn usage_request(user_agent: &str) -> Request<Body> {
    Request::builder()
        .uri("/api/usage")
        .header("user-agent", user_agent)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn usage_reports_without_consuming() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));

    let fresh = body_json(send(&app, usage_request("ua-1")).await).await;
    assert_eq!(fresh["used"], 0);
    assert_eq!(fresh["remaining"], 10);
    assert_eq!(fresh["limit"], 10);
    assert_eq!(fresh["tier"], "anonymous");

    body_string(send(&app, vent_request(&json!({"content": "hi"}), "ua-1")).await).await;

    let after = body_json(send(&app, usage_request("ua-1")).await).await;
    assert_eq!(after["used"], 1);
    assert_eq!(after["remaining"], 9);

    let again = body_json(send(&app, usage_request("ua-1")).await).await;
    assert_eq!(again["used"], 1);
}

#[tokio::test]
async fn trusted_identity_headers_select_user_tier() {
    let mut config = Config::default();
    config.gateway.trust_identity_headers = true;
    let (app, _) = app_with(
        config,
        Arc::new(MemoryStore::new()),
        ScriptedProvider::replying(&["ok"]),
    );

    let request = Request::builder()
        .uri("/api/usage")
        .header("x-user-id", "user-42")
        .header("x-user-tier", "premium")
        .body(Body::empty())
        .unwrap();
    let json = body_json(send(&app, request).await).await;
    assert_eq!(json["tier"], "premium");
    assert_eq!(json["limit"], 100);
}

#[tokio::test]
async fn identity_headers_are_ignored_by_default() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    let request = Request::builder()
        .uri("/api/usage")
        .header("x-user-id", "user-42")
        .header("x-user-tier", "premium")
        .body(Body::empty())
        .unwrap();
    let json = body_json(send(&app, request).await).await;
    assert_eq!(json["tier"], "anonymous");
}

#[tokio::test]
async fn aggregate_defaults_to_thirty_days_and_caps_period() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));

    let json = body_json(send(&app, get("/api/analytics/aggregate")).await).await;
    assert_eq!(json["period_days"], 30);
    assert_eq!(json["total_vents"], 0);

    let json = body_json(send(&app, get("/api/analytics/aggregate?days=9999")).await).await;
    assert_eq!(json["period_days"], 365);
}

#[tokio::test]
async fn aggregate_never_exposes_content() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    body_string(
        send(
            &app,
            vent_request(&json!({"content": "my secret sorrow"}), "ua"),
        )
        .await,
    )
    .await;

    let body = body_string(send(&app, get("/api/analytics/aggregate?days=1")).await).await;
    assert!(!body.contains("secret sorrow"));
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["total_vents"], 1);
}

#[tokio::test]
async fn cors_preflight_allows_configured_origin() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/vent")
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Body::empty())
        .unwrap();

    let response = send(&app, request).await;
    let headers = response.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "http://localhost:3000"
    );
    assert_eq!(headers["access-control-allow-credentials"], "true");
}

#[tokio::test]
async fn cors_exposes_session_headers_to_allowed_origin() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    let mut request = vent_request(&json!({"content": "hi"}), "ua");
    request
        .headers_mut()
        .insert("origin", "http://localhost:3000".parse().unwrap());

    let response = send(&app, request).await;
    let exposed = response.headers()["access-control-expose-headers"]
        .to_str()
        .unwrap()
        .to_ascii_lowercase();
    assert!(exposed.contains("x-session-id"));
    assert!(exposed.contains("x-remaining-vents"));
}

#[tokio::test]
async fn unknown_origin_gets_no_cors_grant() {
    let (app, _) = app(ScriptedProvider::replying(&["ok"]));
    let request = Request::builder()
        .uri("/")
        .header("origin", "https://evil.example")
        .body(Body::empty())
        .unwrap();

    let response = send(&app, request).await;
    assert!(!response
        .headers()
        .contains_key("access-control-allow-origin"));
}
