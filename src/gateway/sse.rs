//! Server-Sent Events framing for vent replies.
//!
//! Each relay frame becomes one SSE event whose `data:` payload is the token
//! text or a sentinel.

use crate::vent::RelayFrame;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use std::borrow::Cow;
use std::convert::Infallible;
use tokio_stream::StreamExt;

/// SSE data may not carry bare carriage returns; fold CRLF and CR into LF.
pub fn normalize_newlines(text: &str) -> Cow<'_, str> {
    if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

pub fn frame_event(frame: &RelayFrame) -> Event {
    Event::default().data(normalize_newlines(frame.data()))
}

/// Wrap relay frames in an SSE response body.
pub fn vent_stream<S>(frames: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = RelayFrame> + Send + 'static,
{
    let events = frames.map(|frame| Ok::<_, Infallible>(frame_event(&frame)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_leaves_plain_text_borrowed() {
        assert!(matches!(normalize_newlines("calm"), Cow::Borrowed("calm")));
    }

    #[test]
    fn normalize_folds_carriage_returns() {
        assert_eq!(normalize_newlines("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[test]
    fn token_with_crlf_frames_without_panicking() {
        let _ = frame_event(&RelayFrame::Token("line one\r\nline two".into()));
        let _ = frame_event(&RelayFrame::Done);
    }
}
