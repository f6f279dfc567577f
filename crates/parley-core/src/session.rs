//! One in-flight generation request.
//!
//! A session issues the vendor request, routes the response body through the
//! stream reader and reports text deltas to its caller. It owns the "taking
//! long" watchdog and honors the caller's cancellation token; it never touches
//! the transcript or the credentials itself.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::providers::{
    Adapter, Endpoint, GenerationRequest, HttpRequest, ProviderError, ProviderResult,
    classify_reqwest_error,
};
use crate::stream::DeltaStream;

/// Default delay before a session without output is reported as slow.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Building,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// Progress reported to the session's caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Delta(String),
    TakingLong(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed(ProviderError),
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed => SessionState::Completed,
            SessionOutcome::Cancelled => SessionState::Cancelled,
            SessionOutcome::Failed(_) => SessionState::Failed,
        }
    }
}

pub struct GenerationSession {
    id: Uuid,
    adapter: Adapter,
    cancel: CancellationToken,
    watchdog: Duration,
    state: SessionState,
    started_at: Instant,
    first_byte_received: bool,
    taking_long: bool,
}

impl GenerationSession {
    pub fn new(adapter: Adapter, cancel: CancellationToken, watchdog: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            adapter,
            cancel,
            watchdog,
            state: SessionState::Idle,
            started_at: Instant::now(),
            first_byte_received: false,
            taking_long: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_taking_long(&self) -> bool {
        self.taking_long
    }

    pub fn first_byte_received(&self) -> bool {
        self.first_byte_received
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Translates `request` into the vendor's wire request.
    ///
    /// # Errors
    /// Fails the session when the request cannot be assembled.
    pub fn build(
        &mut self,
        request: &GenerationRequest,
        endpoint: &Endpoint,
    ) -> ProviderResult<HttpRequest> {
        self.state = SessionState::Building;
        self.adapter
            .build_request(request, endpoint)
            .inspect_err(|err| {
                self.state = SessionState::Failed;
                tracing::info!(
                    session_id = %self.id,
                    kind = %err.kind,
                    error = %err,
                    "Session failed before connecting"
                );
            })
    }

    /// Issues `request` and streams the response until a terminal state.
    #[tracing::instrument(
        name = "session",
        skip_all,
        fields(id = %self.id, adapter = ?self.adapter)
    )]
    pub async fn run<F>(
        &mut self,
        http: &reqwest::Client,
        request: HttpRequest,
        mut on_event: F,
    ) -> SessionOutcome
    where
        F: FnMut(SessionEvent),
    {
        self.arm();
        let deadline = self.started_at + self.watchdog;
        let send = request.into_builder(http).send();
        tokio::pin!(send);

        let response = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.finish(SessionOutcome::Cancelled),
                () = sleep_until(deadline), if !self.taking_long => {
                    self.raise_taking_long(&mut on_event);
                }
                result = &mut send => break result,
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => return self.finish(SessionOutcome::Failed(classify_reqwest_error(&err))),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return self.finish(SessionOutcome::Failed(ProviderError::http_status(
                status.as_u16(),
                &body,
            )));
        }

        self.stream_body(Box::pin(response.bytes_stream()), on_event).await
    }

    /// Consumes an already-open response body.
    pub async fn consume<S, E, F>(&mut self, body: S, on_event: F) -> SessionOutcome
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<ProviderError>,
        F: FnMut(SessionEvent),
    {
        self.arm();
        self.stream_body(body, on_event).await
    }

    async fn stream_body<S, E, F>(&mut self, body: S, mut on_event: F) -> SessionOutcome
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<ProviderError>,
        F: FnMut(SessionEvent),
    {
        let deadline = self.started_at + self.watchdog;
        let mut deltas = DeltaStream::new(body, self.adapter, self.cancel.clone());

        loop {
            let watchdog_armed = !self.first_byte_received && !self.taking_long;
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.finish(SessionOutcome::Cancelled),
                () = sleep_until(deadline), if watchdog_armed => {
                    self.raise_taking_long(&mut on_event);
                    continue;
                }
                item = deltas.next() => item,
            };

            match item {
                Some(Ok(text)) => {
                    if self.cancel.is_cancelled() {
                        return self.finish(SessionOutcome::Cancelled);
                    }
                    if !self.first_byte_received {
                        self.first_byte_received = true;
                        self.state = SessionState::Streaming;
                        if self.taking_long {
                            self.taking_long = false;
                            on_event(SessionEvent::TakingLong(false));
                        }
                    }
                    on_event(SessionEvent::Delta(text));
                }
                Some(Err(err)) => return self.finish(SessionOutcome::Failed(err)),
                None if self.cancel.is_cancelled() => {
                    return self.finish(SessionOutcome::Cancelled);
                }
                None => return self.finish(SessionOutcome::Completed),
            }
        }
    }

    fn arm(&mut self) {
        self.state = SessionState::Connecting;
        self.started_at = Instant::now();
    }

    fn raise_taking_long<F: FnMut(SessionEvent)>(&mut self, on_event: &mut F) {
        self.taking_long = true;
        tracing::info!(session_id = %self.id, "No output yet, reporting slow response");
        on_event(SessionEvent::TakingLong(true));
    }

    fn finish(&mut self, outcome: SessionOutcome) -> SessionOutcome {
        self.state = outcome.state();
        self.taking_long = false;
        match &outcome {
            SessionOutcome::Failed(err) => tracing::info!(
                session_id = %self.id,
                kind = %err.kind,
                error = %err,
                "Session failed"
            ),
            other => tracing::info!(
                session_id = %self.id,
                state = ?other.state(),
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Session ended"
            ),
        }
        outcome
    }
}
