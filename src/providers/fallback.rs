use super::traits::{ChatRequest, Provider, StreamEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Sent when there is no upstream, or when the upstream fails before
/// producing any text.
pub const COMFORT_REPLY: &str =
    "I hear you. What you're feeling matters, and it's okay to let it out. You're not alone in this.";

/// Stands in for an LLM when none is configured: every vent gets
/// [`COMFORT_REPLY`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackProvider;

#[async_trait]
impl Provider for FallbackProvider {
    fn name(&self) -> &str {
        "fallback"
    }

    fn is_configured(&self) -> bool {
        false
    }

    async fn stream_chat(
        &self,
        _request: &ChatRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        if tx
            .send(StreamEvent::TextDelta(COMFORT_REPLY.to_string()))
            .await
            .is_ok()
        {
            let _ = tx.send(StreamEvent::Done).await;
        }
        Ok(())
    }
}
