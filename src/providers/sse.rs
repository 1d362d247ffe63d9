//! Upstream SSE decoding shared by the streaming providers.
//!
//! [`SseDecoder`] turns response bytes into `data` payloads, one per
//! dispatched event. Each payload is parsed as JSON and handed to the
//! provider's [`SseParser`]. The stream always ends with exactly one
//! terminal event on the channel.

use super::traits::StreamEvent;
use crate::config::LlmConfig;
use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeouts applied to one upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Until response headers arrive.
    pub timeout: Duration,
    /// Max gap between body chunks.
    pub idle_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

/// Shared client for one provider. No whole-request timeout: streams are
/// bounded by [`StreamSettings`] instead.
pub(crate) fn build_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Send `request` and wait for a successful status.
pub(crate) async fn send_streaming(
    request: reqwest::RequestBuilder,
    settings: &StreamSettings,
    provider: &str,
) -> Result<reqwest::Response> {
    let response = tokio::time::timeout(settings.timeout, request.send())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "{provider} request timed out after {}s",
                settings.timeout.as_secs()
            )
        })?
        .with_context(|| format!("{provider} request failed"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = read_capped_error_body(response).await;
        anyhow::bail!("{provider} API error ({status}): {body}");
    }
    Ok(response)
}

pub(crate) async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Incremental `text/event-stream` decoder.
///
/// Lines may end in LF, CRLF or a lone CR, and may be split across chunks.
/// Only the `data` field matters here: its lines are joined with `\n` and
/// the result is queued when a blank line closes the event. Comments and
/// other fields are dropped.
#[derive(Debug, Default)]
struct SseDecoder {
    line: Vec<u8>,
    data: Option<String>,
    ready: VecDeque<String>,
    after_cr: bool,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
enum DecodeError {
    #[error("SSE buffer exceeded maximum size (4 MiB)")]
    Overflow,
    #[error("Received invalid UTF-8 from SSE stream")]
    InvalidUtf8,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => self.end_line()?,
                _ => self.line.push(byte),
            }
        }
        if self.buffered() > MAX_SSE_BUFFER_BYTES {
            return Err(DecodeError::Overflow);
        }
        Ok(())
    }

    fn next_payload(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn buffered(&self) -> usize {
        self.line.len()
            + self.data.as_ref().map_or(0, String::len)
            + self.ready.iter().map(String::len).sum::<usize>()
    }

    fn end_line(&mut self) -> Result<(), DecodeError> {
        let line = std::mem::take(&mut self.line);
        if line.is_empty() {
            if let Some(data) = self.data.take() {
                self.ready.push_back(data);
            }
            return Ok(());
        }

        let line = std::str::from_utf8(&line).map_err(|_| DecodeError::InvalidUtf8)?;
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseParseAction {
    /// Nothing to emit for this payload
    Continue,
    Emit(Vec<StreamEvent>),
    /// Vendor-specific end marker (message_stop, finishReason=STOP)
    Done,
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn provider_name(&self) -> &'static str;
}

pub(crate) fn emit_or_continue(events: Vec<StreamEvent>) -> SseParseAction {
    if events.is_empty() {
        SseParseAction::Continue
    } else {
        SseParseAction::Emit(events)
    }
}

/// Outcome of one decoded payload.
enum Step {
    Skip,
    Forward(Vec<StreamEvent>),
    Finish(StreamEvent),
}

/// Interpret one payload. `bad_run` counts consecutive unparseable payloads.
fn interpret<P: SseParser>(parser: &mut P, data: &str, bad_run: &mut usize) -> Step {
    if data == "[DONE]" {
        return Step::Finish(StreamEvent::Done);
    }

    let json = match serde_json::from_str::<serde_json::Value>(data) {
        Ok(json) => json,
        Err(e) => {
            *bad_run += 1;
            tracing::warn!(
                %e,
                payload_bytes = data.len(),
                provider = parser.provider_name(),
                "Invalid SSE JSON payload"
            );
            if *bad_run >= MAX_SSE_PARSE_ERRORS {
                return Step::Finish(StreamEvent::Error(format!("Invalid stream payload: {e}")));
            }
            return Step::Skip;
        }
    };
    *bad_run = 0;

    match parser.parse(&json) {
        SseParseAction::Continue => Step::Skip,
        SseParseAction::Emit(events) => Step::Forward(events),
        SseParseAction::Done => Step::Finish(StreamEvent::Done),
        SseParseAction::Error(msg) => Step::Finish(StreamEvent::Error(msg)),
    }
}

/// Drive `stream` through `parser`, forwarding events into `tx`.
///
/// Transport errors are returned as `Err`; every other way the stream can
/// end is reported through `tx`.
pub(crate) async fn process_sse_stream<S, B, E, P>(
    stream: S,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<()>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
    P: SseParser,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::default();
    let mut bad_run = 0usize;

    let terminal = 'read: loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            break StreamEvent::Error("Stream idle timeout".to_string());
        };
        let Some(chunk) = next else {
            break StreamEvent::Error("Connection closed before stream completed".to_string());
        };
        let chunk =
            chunk.with_context(|| format!("{} stream interrupted", parser.provider_name()))?;

        if let Err(e) = decoder.push(chunk.as_ref()) {
            break StreamEvent::Error(e.to_string());
        }

        while let Some(data) = decoder.next_payload() {
            match interpret(parser, &data, &mut bad_run) {
                Step::Skip => {}
                Step::Finish(event) => break 'read event,
                Step::Forward(events) => {
                    for event in events {
                        let is_terminal = event.is_terminal();
                        if tx.send(event).await.is_err() || is_terminal {
                            return Ok(());
                        }
                    }
                }
            }
        }
    };

    // The receiver may already be gone; nothing left to report to.
    let _ = tx.send(terminal).await;
    Ok(())
}
