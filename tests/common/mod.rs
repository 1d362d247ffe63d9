#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tower::ServiceExt;
use ventvault::config::Config;
use ventvault::gateway::{build_router, AppState};
use ventvault::providers::{ChatRequest, Provider, StreamEvent};
use ventvault::ratelimit::{CounterStore, MemoryStore};

/// Provider that replays a fixed script and records every request it saw.
pub struct ScriptedProvider {
    script: Vec<StreamEvent>,
    pub seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<StreamEvent>) -> Arc<Self> {
        Arc::new(Self {
            script,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(tokens: &[&str]) -> Arc<Self> {
        let mut script: Vec<StreamEvent> = tokens
            .iter()
            .map(|t| StreamEvent::TextDelta((*t).to_string()))
            .collect();
        script.push(StreamEvent::Done);
        Self::new(script)
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last_request(&self) -> ChatRequest {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(request.clone());
        for event in &self.script {
            if tx.send(event.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

pub fn app_with(
    config: Config,
    store: Arc<dyn CounterStore>,
    provider: Arc<dyn Provider>,
) -> (Router, AppState) {
    let state = AppState::new(config, store, provider);
    (build_router(state.clone()), state)
}

pub fn app(provider: Arc<dyn Provider>) -> (Router, AppState) {
    app_with(Config::default(), Arc::new(MemoryStore::new()), provider)
}

pub fn vent_request(body: &serde_json::Value, user_agent: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/vent")
        .header("content-type", "application/json")
        .header("user-agent", user_agent)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// Payloads of the SSE events in `body`, multi-line data joined with `\n`.
/// Comment-only blocks (keep-alives) are skipped.
pub fn sse_events(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|block| {
            let lines: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();
            (!lines.is_empty()).then(|| lines.join("\n"))
        })
        .collect()
}
