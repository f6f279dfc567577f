//! Server-sent event decoding over a response body.
//!
//! [`DeltaStream`] runs the body through `eventsource-stream`, feeds each
//! event's `data` to a provider [`Adapter`] and yields only text deltas,
//! ending at the vendor's terminal sentinel.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use eventsource_stream::{EventStream, EventStreamError, Eventsource};
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::providers::{Adapter, ProviderError, ProviderResult, StreamEvent};

/// Appends a blank line once the body ends so a final event sent without its
/// terminator is still dispatched.
struct TerminatedBody<S> {
    inner: S,
    terminated: bool,
}

impl<S, E> Stream for TerminatedBody<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            Some(item) => Poll::Ready(Some(item)),
            None => {
                self.terminated = true;
                Poll::Ready(Some(Ok(Bytes::from_static(b"\n\n"))))
            }
        }
    }
}

/// Text deltas decoded by one adapter from an event stream.
///
/// Malformed frames are logged and skipped. A vendor error frame ends the
/// stream with an `ApiError`. Once `cancel` fires the stream ends, dropping
/// any events already decoded but not yet yielded.
pub struct DeltaStream<S> {
    events: EventStream<TerminatedBody<S>>,
    adapter: Adapter,
    cancel: CancellationToken,
    done: bool,
}

impl<S, E> DeltaStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(inner: S, adapter: Adapter, cancel: CancellationToken) -> Self {
        let body = TerminatedBody {
            inner,
            terminated: false,
        };
        Self {
            events: body.eventsource(),
            adapter,
            cancel,
            done: false,
        }
    }
}

impl<S> DeltaStream<S> {
    /// Maps one event payload. `None` means keep reading.
    fn handle_data(&mut self, data: &str) -> Option<ProviderResult<String>> {
        let data = data.trim();
        if data.is_empty() {
            return None;
        }
        if self.adapter.done_marker() == Some(data) {
            self.done = true;
            return None;
        }

        match self.adapter.parse_frame(data) {
            Ok(StreamEvent::TextDelta(text)) => Some(Ok(text)),
            Ok(StreamEvent::Ignorable) => None,
            Ok(StreamEvent::Done) => {
                self.done = true;
                None
            }
            Ok(StreamEvent::Error {
                error_type,
                message,
            }) => {
                self.done = true;
                Some(Err(ProviderError::api_error(&error_type, &message)))
            }
            Err(err) => {
                tracing::debug!(
                    adapter = ?self.adapter,
                    error = %err,
                    "Skipping malformed frame"
                );
                None
            }
        }
    }
}

impl<S, E> Stream for DeltaStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<ProviderError>,
{
    type Item = ProviderResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.cancel.is_cancelled() {
                self.done = true;
                return Poll::Ready(None);
            }
            if self.done {
                return Poll::Ready(None);
            }

            let event = match ready!(Pin::new(&mut self.events).poll_next(cx)) {
                Some(Ok(event)) => event,
                Some(Err(EventStreamError::Transport(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(err.into())));
                }
                Some(Err(EventStreamError::Utf8(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProviderError::parse(format!(
                        "SSE stream error: {err}"
                    )))));
                }
                Some(Err(EventStreamError::Parser(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProviderError::parse(format!(
                        "SSE stream error: {err}"
                    )))));
                }
                None => {
                    self.done = true;
                    return Poll::Ready(None);
                }
            };

            if let Some(item) = self.handle_data(&event.data) {
                return Poll::Ready(Some(item));
            }
        }
    }
}
