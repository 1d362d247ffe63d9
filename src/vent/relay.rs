//! Turns provider [`StreamEvent`]s into client frames.
//!
//! Every relayed stream ends with exactly one sentinel frame (`[DONE]` or
//! `[ERROR]`) and nothing after it. A stream that fails before relaying any
//! text gets the comfort reply first, so the client never shows an empty
//! answer.

use crate::providers::{StreamEvent, COMFORT_REPLY};
use futures_util::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const DONE_SENTINEL: &str = "[DONE]";
pub const ERROR_SENTINEL: &str = "[ERROR]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Token(String),
    Done,
    Error,
}

impl RelayFrame {
    /// Payload of the SSE `data:` line.
    pub fn data(&self) -> &str {
        match self {
            RelayFrame::Token(text) => text,
            RelayFrame::Done => DONE_SENTINEL,
            RelayFrame::Error => ERROR_SENTINEL,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, RelayFrame::Token(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
    /// The client went away before a sentinel was produced.
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub outcome: Outcome,
    /// Upstream text deltas relayed to the client.
    pub tokens: usize,
    pub latency: Duration,
    /// The comfort reply was substituted for a failed upstream.
    pub fallback_used: bool,
}

struct RelayState<F>
where
    F: FnOnce(RelaySummary),
{
    rx: mpsc::Receiver<StreamEvent>,
    pending: VecDeque<RelayFrame>,
    tokens: usize,
    finished: bool,
    fallback_used: bool,
    started: Instant,
    on_complete: Option<F>,
}

impl<F> RelayState<F>
where
    F: FnOnce(RelaySummary),
{
    fn report(&mut self, outcome: Outcome) {
        if let Some(callback) = self.on_complete.take() {
            callback(RelaySummary {
                outcome,
                tokens: self.tokens,
                latency: self.started.elapsed(),
                fallback_used: self.fallback_used,
            });
        }
    }

    fn finish(&mut self, sentinel: RelayFrame) {
        let outcome = if sentinel == RelayFrame::Done {
            Outcome::Completed
        } else {
            Outcome::Failed
        };
        self.pending.push_back(sentinel);
        self.finished = true;
        self.report(outcome);
    }

    fn fail(&mut self, reason: &str) {
        tracing::warn!(tokens = self.tokens, "Vent stream failed: {reason}");
        if self.tokens == 0 {
            self.fallback_used = true;
            self.pending
                .push_back(RelayFrame::Token(COMFORT_REPLY.to_string()));
        }
        self.finish(RelayFrame::Error);
    }
}

impl<F> Drop for RelayState<F>
where
    F: FnOnce(RelaySummary),
{
    fn drop(&mut self) {
        self.report(Outcome::Cancelled);
    }
}

/// Relay `rx` as frames. `on_complete` runs once: when the sentinel is
/// produced, or with [`Outcome::Cancelled`] if the stream is dropped first.
pub fn relay_frames<F>(
    rx: mpsc::Receiver<StreamEvent>,
    started: Instant,
    on_complete: F,
) -> impl Stream<Item = RelayFrame>
where
    F: FnOnce(RelaySummary) + Send + 'static,
{
    let state = RelayState {
        rx,
        pending: VecDeque::new(),
        tokens: 0,
        finished: false,
        fallback_used: false,
        started,
        on_complete: Some(on_complete),
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((frame, state));
            }
            if state.finished {
                return None;
            }
            match state.rx.recv().await {
                Some(StreamEvent::TextDelta(text)) if text.is_empty() => {}
                Some(StreamEvent::TextDelta(text)) => {
                    state.tokens += 1;
                    return Some((RelayFrame::Token(text), state));
                }
                Some(StreamEvent::Done) => state.finish(RelayFrame::Done),
                Some(StreamEvent::Error(message)) => state.fail(&message),
                None => state.fail("upstream closed without a terminal event"),
            }
        }
    })
}
