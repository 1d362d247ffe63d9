//! Google Gemini provider using `streamGenerateContent` in SSE mode.

use super::sse::{self, SseParseAction, SseParser, StreamSettings};
use super::traits::{ChatRequest, Provider, Role, StreamEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    base_url: String,
    api_key: Option<String>,
    settings: StreamSettings,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    system_instruction: SystemInstruction<'a>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
}

impl GeminiProvider {
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

    fn stream_url(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }

    fn build_body<'a>(request: &'a ChatRequest) -> GenerateContentRequest<'a> {
        GenerateContentRequest {
            contents: request
                .messages
                .iter()
                .map(|m| Content {
                    role: match m.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    },
                    parts: [Part { text: &m.content }],
                })
                .collect(),
            system_instruction: SystemInstruction {
                parts: [Part {
                    text: &request.system,
                }],
            },
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

/// Each payload is a partial `GenerateContentResponse`. There is no `[DONE]`;
/// a `finishReason` on the candidate marks the last chunk.
struct GenerateContentParser;

impl SseParser for GenerateContentParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction {
        if let Some(message) = json.pointer("/error/message").and_then(|m| m.as_str()) {
            return SseParseAction::Error(format!("Gemini stream error: {message}"));
        }
        if let Some(reason) = json
            .pointer("/promptFeedback/blockReason")
            .and_then(|r| r.as_str())
        {
            return SseParseAction::Error(format!("Gemini blocked the prompt: {reason}"));
        }

        let Some(candidate) = json.pointer("/candidates/0") else {
            return SseParseAction::Continue;
        };

        let mut events: Vec<StreamEvent> = candidate
            .pointer("/content/parts")
            .and_then(|p| p.as_array())
            .into_iter()
            .flatten()
            // Thought summaries are not part of the reply
            .filter(|part| part.get("thought").and_then(|t| t.as_bool()) != Some(true))
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .filter(|text| !text.is_empty())
            .map(|text| StreamEvent::TextDelta(text.to_string()))
            .collect();

        match candidate.get("finishReason").and_then(|r| r.as_str()) {
            None | Some("FINISH_REASON_UNSPECIFIED") => sse::emit_or_continue(events),
            Some("STOP" | "MAX_TOKENS") => {
                events.push(StreamEvent::Done);
                SseParseAction::Emit(events)
            }
            Some(other) => {
                events.push(StreamEvent::Error(format!(
                    "Gemini stopped generating: {other}"
                )));
                SseParseAction::Emit(events)
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "google"
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
            anyhow::anyhow!("Gemini API key not set. Set GOOGLE_API_KEY or edit config.toml.")
        })?;

        let builder = self
            .client
            .post(self.stream_url(&request.model))
            .header("x-goog-api-key", api_key)
            .json(&Self::build_body(request));

        let response = sse::send_streaming(builder, &self.settings, "Gemini").await?;
        sse::process_sse_stream(
            response.bytes_stream(),
            &mut GenerateContentParser,
            tx,
            self.settings.idle_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::ChatMessage;

    #[test]
    fn stream_url_strips_models_prefix() {
        let p = GeminiProvider::new(Some("key"));
        assert_eq!(
            p.stream_url("models/gemini-2.5-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(p.stream_url("gemini-2.5-flash"), p.stream_url("models/gemini-2.5-flash"));
    }

    #[test]
    fn body_maps_roles_and_config() {
        let request = ChatRequest {
            system: "listen".into(),
            messages: vec![ChatMessage::user("a"), ChatMessage::assistant("b")],
            model: "gemini-2.5-flash".into(),
            temperature: 0.5,
            max_tokens: 512,
        };
        let json = serde_json::to_value(GeminiProvider::build_body(&request)).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][1]["parts"][0]["text"], "b");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "listen");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn parser_emits_text_then_done_on_stop() {
        let mut parser = GenerateContentParser;
        let partial = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "That sounds"}]}}]
        });
        assert_eq!(
            parser.parse(&partial),
            SseParseAction::Emit(vec![StreamEvent::TextDelta("That sounds".into())])
        );

        let last = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": " hard."}]},
                "finishReason": "STOP"
            }]
        });
        assert_eq!(
            parser.parse(&last),
            SseParseAction::Emit(vec![
                StreamEvent::TextDelta(" hard.".into()),
                StreamEvent::Done
            ])
        );
    }

    #[test]
    fn parser_reports_safety_stops_and_blocks() {
        let mut parser = GenerateContentParser;
        let safety = serde_json::json!({"candidates": [{"finishReason": "SAFETY"}]});
        assert!(matches!(
            parser.parse(&safety),
            SseParseAction::Emit(events) if matches!(&events[..], [StreamEvent::Error(_)])
        ));

        let blocked = serde_json::json!({"promptFeedback": {"blockReason": "OTHER"}});
        assert!(matches!(parser.parse(&blocked), SseParseAction::Error(_)));

        let usage_only = serde_json::json!({"usageMetadata": {"totalTokenCount": 12}});
        assert_eq!(parser.parse(&usage_only), SseParseAction::Continue);
    }
}
