use super::sse::{self, SseParseAction, SseParser, StreamSettings};
use super::traits::{ChatRequest, Provider, StreamEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    api_key: Option<String>,
    settings: StreamSettings,
    client: Client,
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<&str>) -> Self {
        Self::with_base_url(None, api_key, StreamSettings::default())
    }

    pub fn with_base_url(
        base_url: Option<&str>,
        api_key: Option<&str>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.map(ToString::to_string),
            settings,
            client: sse::build_client(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

/// Messages API events: text arrives in `content_block_delta`, the end is
/// `message_stop`.
struct MessagesParser;

impl SseParser for MessagesParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction {
        match json.get("type").and_then(|t| t.as_str()) {
            Some("content_block_delta") => {
                let delta = json.get("delta");
                let is_text = delta
                    .and_then(|d| d.get("type"))
                    .and_then(|t| t.as_str())
                    == Some("text_delta");
                match delta.and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                    Some(text) if is_text && !text.is_empty() => {
                        SseParseAction::Emit(vec![StreamEvent::TextDelta(text.to_string())])
                    }
                    _ => SseParseAction::Continue,
                }
            }
            Some("message_stop") => SseParseAction::Done,
            Some("error") => {
                let message = json
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                SseParseAction::Error(format!("Anthropic stream error: {message}"))
            }
            _ => SseParseAction::Continue,
        }
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            anyhow::anyhow!("Anthropic API key not set. Set ANTHROPIC_API_KEY or edit config.toml.")
        })?;

        let body = StreamRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: request
                .messages
                .iter()
                .map(|m| Message {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            stream: true,
        };

        let builder = self
            .client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let response = sse::send_streaming(builder, &self.settings, "Anthropic").await?;
        sse::process_sse_stream(
            response.bytes_stream(),
            &mut MessagesParser,
            tx,
            self.settings.idle_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_with_key() {
        let p = AnthropicProvider::new(Some("sk-ant-test123"));
        assert_eq!(p.api_key.as_deref(), Some("sk-ant-test123"));
        assert!(p.is_configured());
    }

    #[test]
    fn creates_with_empty_key() {
        let p = AnthropicProvider::new(Some(""));
        assert_eq!(p.api_key.as_deref(), Some(""));
        assert!(!p.is_configured());
    }

    #[test]
    fn messages_url_uses_base() {
        let p = AnthropicProvider::with_base_url(
            Some("http://localhost:4010/"),
            None,
            StreamSettings::default(),
        );
        assert_eq!(p.messages_url(), "http://localhost:4010/v1/messages");
        assert_eq!(
            AnthropicProvider::new(None).messages_url(),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn parser_handles_event_types() {
        let mut parser = MessagesParser;
        let delta = serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "I hear"}
        });
        assert_eq!(
            parser.parse(&delta),
            SseParseAction::Emit(vec![StreamEvent::TextDelta("I hear".into())])
        );

        let ping = serde_json::json!({"type": "ping"});
        assert_eq!(parser.parse(&ping), SseParseAction::Continue);

        let stop = serde_json::json!({"type": "message_stop"});
        assert_eq!(parser.parse(&stop), SseParseAction::Done);

        let overloaded = serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        });
        assert!(matches!(parser.parse(&overloaded), SseParseAction::Error(m) if m.contains("Overloaded")));
    }
}
