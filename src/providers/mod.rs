pub mod anthropic;
pub mod fallback;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod traits;

pub use fallback::{FallbackProvider, COMFORT_REPLY};
pub use sse::StreamSettings;
pub use traits::{ChatMessage, ChatRequest, Provider, Role, StreamEvent};

use crate::config::{LlmConfig, LlmProvider};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bounded so a slow client applies backpressure to the upstream read.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Factory: create the configured provider.
///
/// A vendor without an API key degrades to [`FallbackProvider`] so the
/// service keeps answering; `/health` reports the LLM as not configured.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn Provider> {
    let settings = StreamSettings::from_config(config);
    let base_url = config.base_url.as_deref();

    let Some(api_key) = config.api_key() else {
        if config.provider != LlmProvider::Fallback {
            tracing::warn!(
                provider = %config.provider,
                "No API key configured for LLM provider, using canned replies"
            );
        }
        return Arc::new(FallbackProvider);
    };

    match config.provider {
        LlmProvider::OpenAi => Arc::new(openai::OpenAiProvider::with_base_url(
            base_url,
            Some(api_key),
            settings,
        )),
        LlmProvider::Anthropic => Arc::new(anthropic::AnthropicProvider::with_base_url(
            base_url,
            Some(api_key),
            settings,
        )),
        LlmProvider::Google => Arc::new(gemini::GeminiProvider::with_base_url(
            base_url,
            Some(api_key),
            settings,
        )),
        LlmProvider::Fallback => Arc::new(FallbackProvider),
    }
}

/// Run `provider` on its own task and return the receiving end.
///
/// An `Err` from the provider becomes a final [`StreamEvent::Error`].
/// Dropping the receiver stops the task at its next send.
pub fn spawn_stream(
    provider: Arc<dyn Provider>,
    request: ChatRequest,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        if let Err(e) = provider.stream_chat(&request, &tx).await {
            tracing::warn!(provider = provider.name(), "LLM stream failed: {e:#}");
            let _ = tx.send(StreamEvent::Error(format!("{e:#}"))).await;
        }
    });
    rx
}
