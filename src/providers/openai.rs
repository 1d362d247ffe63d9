use super::sse::{self, emit_or_continue, SseParseAction, SseParser, StreamSettings};
use super::traits::{ChatRequest, Provider, StreamEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    base_url: String,
    credential: Option<String>,
    settings: StreamSettings,
    client: Client,
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

impl OpenAiProvider {
    pub fn new(credential: Option<&str>) -> Self {
        Self::with_base_url(None, credential, StreamSettings::default())
    }

    /// Defaults to `https://api.openai.com/v1` when `base_url` is `None`.
    pub fn with_base_url(
        base_url: Option<&str>,
        credential: Option<&str>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credential: credential.map(ToString::to_string),
            settings,
            client: sse::build_client(),
        }
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body<'a>(request: &'a ChatRequest) -> StreamRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(Message {
            role: "system",
            content: &request.system,
        });
        messages.extend(request.messages.iter().map(|m| Message {
            role: m.role.as_str(),
            content: &m.content,
        }));
        StreamRequest {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        }
    }
}

/// Chat Completions chunks: `choices[0].delta.content`; the end is `[DONE]`.
struct ChatCompletionsParser;

impl SseParser for ChatCompletionsParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction {
        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return SseParseAction::Error(format!("OpenAI stream error: {message}"));
        }

        let events = json
            .get("choices")
            .and_then(|c| c.as_array())
            .into_iter()
            .flatten()
            .filter_map(|choice| choice.pointer("/delta/content").and_then(|c| c.as_str()))
            .filter(|text| !text.is_empty())
            .map(|text| StreamEvent::TextDelta(text.to_string()))
            .collect();
        emit_or_continue(events)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_configured(&self) -> bool {
        self.credential.as_deref().is_some_and(|c| !c.is_empty())
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        let credential = self.credential.as_deref().ok_or_else(|| {
            anyhow::anyhow!("OpenAI API key not set. Set OPENAI_API_KEY or edit config.toml.")
        })?;

        let builder = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(credential)
            .json(&Self::build_body(request));

        let response = sse::send_streaming(builder, &self.settings, "OpenAI").await?;
        sse::process_sse_stream(
            response.bytes_stream(),
            &mut ChatCompletionsParser,
            tx,
            self.settings.idle_timeout,
        )
        .await
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        if let Some(credential) = self.credential.as_deref() {
            self.client
                .get(format!("{}/models", self.base_url))
                .bearer_auth(credential)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::ChatMessage;

    #[test]
    fn creates_with_key() {
        let p = OpenAiProvider::new(Some("sk-proj-abc123"));
        assert_eq!(p.credential.as_deref(), Some("sk-proj-abc123"));
        assert!(p.is_configured());
    }

    #[test]
    fn creates_without_key() {
        let p = OpenAiProvider::new(None);
        assert!(p.credential.is_none());
        assert!(!p.is_configured());
    }

    #[test]
    fn custom_base_url_is_trimmed() {
        let p = OpenAiProvider::with_base_url(
            Some("http://127.0.0.1:9999/v1/"),
            Some("k"),
            StreamSettings::default(),
        );
        assert_eq!(p.chat_completions_url(), "http://127.0.0.1:9999/v1/chat/completions");
    }

    #[test]
    fn body_puts_system_first_and_streams() {
        let request = ChatRequest {
            system: "be kind".into(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 256,
        };
        let json = serde_json::to_value(OpenAiProvider::build_body(&request)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "be kind");
        assert_eq!(json["messages"][2]["role"], "assistant");
    }

    #[test]
    fn parser_extracts_delta_content() {
        let mut parser = ChatCompletionsParser;
        let chunk = serde_json::json!({
            "choices": [{"index": 0, "delta": {"content": "Hey"}, "finish_reason": null}]
        });
        assert_eq!(
            parser.parse(&chunk),
            SseParseAction::Emit(vec![StreamEvent::TextDelta("Hey".into())])
        );

        let role_only = serde_json::json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(parser.parse(&role_only), SseParseAction::Continue);

        let error = serde_json::json!({"error": {"message": "quota exceeded"}});
        assert!(matches!(parser.parse(&error), SseParseAction::Error(m) if m.contains("quota")));
    }
}
