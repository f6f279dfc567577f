//! Chat controller: one transcript, one session at a time.
//!
//! Send and regenerate acquire a credential, mutate the transcript, run a
//! generation session and then settle the outcome: finalize and count usage on
//! success, keep partial output on cancel, roll back and invalidate the trial
//! key on failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, TelemetryEvent, TelemetryKind, UserType};
use crate::config::Config;
use crate::credentials::{
    CredentialAllocator, CredentialMode, KeyStatus, KeyStatusUpdate, KeyValidator, check_key,
};
use crate::error::ChatError;
use crate::events::{ChatEvent, EventSender};
use crate::providers::{Endpoint, GenerationRequest, ProviderKind};
use crate::session::{GenerationSession, SessionEvent, SessionOutcome, SessionState};
use crate::store::{self, KvStore, RetentionWindow};
use crate::transcript::{Attachment, Message, Transcript};

/// Upper bound on waiting for in-flight telemetry at shutdown.
pub const TELEMETRY_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolved settings for one controller.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub provider: ProviderKind,
    pub model: String,
    pub mode: CredentialMode,
    pub assistant: String,
    pub grounding: bool,
    pub max_tokens: u32,
    pub default_system_prompt: String,
    pub watchdog: Duration,
    pub validation_debounce: Duration,
    pub retention: RetentionWindow,
    pub trial_provider: ProviderKind,
    pub trial_uses: u32,
    pub base_urls: HashMap<ProviderKind, String>,
}

impl ChatSettings {
    /// # Errors
    /// Returns an error for unknown provider ids or invalid base URLs.
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = config.provider_kind()?;
        let base_urls = ProviderKind::all()
            .iter()
            .map(|kind| -> Result<(ProviderKind, String)> {
                Ok((*kind, config.base_url_for(*kind)?))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            provider,
            model: config.model_for(provider),
            mode: config.mode,
            assistant: config.assistant.clone(),
            grounding: config.grounding,
            max_tokens: config.max_tokens,
            default_system_prompt: config.default_system_prompt.clone(),
            watchdog: config.watchdog(),
            validation_debounce: config.validation_debounce(),
            retention: config.auto_delete_hours,
            trial_provider: config.trial_provider_kind()?,
            trial_uses: config.trial_uses,
            base_urls,
        })
    }

    /// Grounding only reaches vendors whose request shape has a tools field.
    pub fn grounding_enabled(&self) -> bool {
        self.grounding && self.provider.adapter().capabilities().supports_tools_field
    }

    fn base_url(&self, provider: ProviderKind) -> String {
        self.base_urls
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| provider.default_base_url().to_string())
    }
}

/// Cancels whichever session is active when `stop()` is called.
#[derive(Clone, Default)]
pub struct StopHandle {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl StopHandle {
    /// Returns `true` if a session was running.
    pub fn stop(&self) -> bool {
        let slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    fn end(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Result of a session that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub index: usize,
    pub content: String,
    pub state: SessionState,
}

pub struct ChatController {
    settings: ChatSettings,
    http: reqwest::Client,
    backend: BackendClient,
    store: Arc<dyn KvStore>,
    transcript: Transcript,
    allocator: CredentialAllocator,
    validator: KeyValidator,
    key_updates: mpsc::Receiver<KeyStatusUpdate>,
    events: EventSender,
    stop: StopHandle,
    telemetry: JoinSet<()>,
}

impl ChatController {
    /// Builds a controller, restoring the assistant's saved transcript.
    pub fn new(
        settings: ChatSettings,
        http: reqwest::Client,
        backend: BackendClient,
        store: Arc<dyn KvStore>,
        events: EventSender,
    ) -> Self {
        let allocator = CredentialAllocator::new(
            Arc::clone(&store),
            settings.trial_provider,
            settings.trial_uses,
        );
        let (updates_tx, key_updates) = mpsc::channel(16);
        let validator = KeyValidator::new(http.clone(), settings.validation_debounce, updates_tx);
        let transcript =
            store::load_transcript(store.as_ref(), &settings.assistant, settings.retention)
                .map(Transcript::from_history)
                .unwrap_or_default();

        Self {
            settings,
            http,
            backend,
            store,
            transcript,
            allocator,
            validator,
            key_updates,
            events,
            stop: StopHandle::default(),
            telemetry: JoinSet::new(),
        }
    }

    /// Builds a controller from config, seeding personal keys (config > env).
    ///
    /// # Errors
    /// Returns an error for invalid settings or if the HTTP client fails to build.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn KvStore>,
        events: EventSender,
    ) -> Result<Self> {
        let settings = ChatSettings::from_config(config)?;
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        let backend = BackendClient::new(http.clone(), config.issuer_url.clone());

        let mut controller = Self::new(settings, http, backend, store, events);
        for kind in ProviderKind::all() {
            if let Some(key) = config.api_key_for(*kind) {
                controller.allocator.set_personal_key(*kind, &key);
            }
        }
        Ok(controller)
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    pub fn allocator(&self) -> &CredentialAllocator {
        &self.allocator
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.transcript.is_streaming()
    }

    /// Records a personal key edit and schedules a debounced probe.
    pub fn set_personal_key(&mut self, provider: ProviderKind, key: &str) {
        self.allocator.set_personal_key(provider, key);
        if !key.trim().is_empty() {
            let base_url = self.settings.base_url(provider);
            self.validator.schedule(provider, key, &base_url);
        }
    }

    /// Applies finished key probes. Returns the number applied.
    pub fn poll_key_updates(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.key_updates.try_recv() {
            if self.allocator.apply_status(&update) {
                applied += 1;
                self.events.send_delta(ChatEvent::KeyStatusChanged {
                    provider: update.provider.id().to_string(),
                    status: update.status,
                });
            }
        }
        applied
    }

    /// Probes the personal key now unless a probe already settled it.
    pub async fn ensure_key_checked(&mut self, provider: ProviderKind) -> KeyStatus {
        self.poll_key_updates();
        let status = self.allocator.key_status(provider);
        if matches!(status, KeyStatus::Valid | KeyStatus::Invalid) {
            return status;
        }
        let Some(key) = self.allocator.personal_key(provider).map(str::to_string) else {
            return status;
        };

        let base_url = self.settings.base_url(provider);
        let status = check_key(&self.http, provider, &base_url, &key).await;
        let update = KeyStatusUpdate {
            provider,
            key,
            status,
        };
        if self.allocator.apply_status(&update) {
            self.events
                .send_important(ChatEvent::KeyStatusChanged {
                    provider: provider.id().to_string(),
                    status,
                })
                .await;
        }
        status
    }

    /// Sends a user turn and streams the reply into a new assistant message.
    ///
    /// # Errors
    /// `Busy`, `VisionUnsupported` and `Credential` errors leave the
    /// transcript untouched; session failures roll back the exchange.
    pub async fn send(
        &mut self,
        content: &str,
        attachments: Vec<Arc<Attachment>>,
    ) -> Result<Generation, ChatError> {
        if self.transcript.is_streaming() {
            return Err(ChatError::Busy);
        }
        if attachments.iter().any(|attachment| attachment.is_image()) {
            self.ensure_vision()?;
        }

        let provider = self.settings.provider;
        let mode = self.settings.mode;
        if mode == CredentialMode::Personal {
            self.ensure_key_checked(provider).await;
        }
        let key = self
            .allocator
            .acquire(provider, mode, &self.backend)
            .await?;

        let system_prompt = self
            .backend
            .resolve_prompt(&self.settings.assistant, &self.settings.default_system_prompt)
            .await;

        self.transcript.append_user_turn(content, attachments)?;
        let index = self.transcript.append_streaming_placeholder()?;
        let request = GenerationRequest::from_history(
            self.transcript.history_before(index),
            &system_prompt,
            self.settings.grounding_enabled(),
            self.settings.max_tokens,
        );

        let telemetry = match mode {
            CredentialMode::Shared => TelemetryKind::TrialGeneration,
            CredentialMode::Personal => TelemetryKind::Generation,
        };
        self.run_session(index, false, &key.key, mode, &request, telemetry)
            .await
    }

    /// Regenerates the assistant message at `index` (default: the last one).
    ///
    /// # Errors
    /// `Regenerate` errors leave the transcript untouched; a failed
    /// regeneration restores the previous content.
    pub async fn regenerate(&mut self, index: Option<usize>) -> Result<Generation, ChatError> {
        if self.transcript.is_streaming() {
            return Err(ChatError::Busy);
        }
        let index = index
            .or_else(|| self.transcript.last_assistant_index())
            .ok_or(crate::transcript::RegenerateError::NoPrecedingPrompt)?;
        self.transcript.check_regenerate(index)?;
        if self
            .transcript
            .history_before(index)
            .iter()
            .flat_map(|message| &message.attachments)
            .any(|attachment| attachment.is_image())
        {
            self.ensure_vision()?;
        }

        let provider = self.settings.provider;
        let mode = self.settings.mode;
        if mode == CredentialMode::Personal {
            self.ensure_key_checked(provider).await;
        }
        let key = self
            .allocator
            .acquire(provider, mode, &self.backend)
            .await?;

        let system_prompt = self
            .backend
            .resolve_prompt(&self.settings.assistant, &self.settings.default_system_prompt)
            .await;

        self.transcript.regenerate_at(index)?;
        let request = GenerationRequest::from_history(
            self.transcript.history_before(index),
            &system_prompt,
            self.settings.grounding_enabled(),
            self.settings.max_tokens,
        );

        self.run_session(index, true, &key.key, mode, &request, TelemetryKind::Regeneration)
            .await
    }

    /// Waits up to `timeout` for telemetry still in flight, then drops the rest.
    ///
    /// Returns the number of events abandoned.
    pub async fn flush_telemetry(&mut self, timeout: Duration) -> usize {
        let tasks = &mut self.telemetry;
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let abandoned = self.telemetry.len();
        tracing::debug!(abandoned, "Telemetry flush timed out");
        self.telemetry.abort_all();
        abandoned
    }

    /// Forgets cached system prompts so the next request refetches them.
    pub fn reload_prompts(&self) {
        self.backend.clear_prompt_cache();
    }

    /// Deletes the message at `index`.
    ///
    /// # Errors
    /// Returns a transcript error for a bad or busy index.
    pub fn delete(&mut self, index: usize) -> Result<Message, ChatError> {
        let removed = self.transcript.delete_at(index)?;
        self.persist_transcript();
        Ok(removed)
    }

    /// Removes every message.
    ///
    /// # Errors
    /// Returns `Busy` during a generation.
    pub fn clear(&mut self) -> Result<(), ChatError> {
        if self.transcript.is_streaming() {
            return Err(ChatError::Busy);
        }
        self.transcript.clear()?;
        self.persist_transcript();
        Ok(())
    }

    fn ensure_vision(&self) -> Result<(), ChatError> {
        let provider = self.settings.provider.provider();
        // Models outside the catalog are trusted with images.
        match provider.model(&self.settings.model) {
            Some(model) if !model.supports_vision => Err(ChatError::VisionUnsupported {
                model: model.name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn run_session(
        &mut self,
        index: usize,
        regenerate: bool,
        api_key: &str,
        mode: CredentialMode,
        request: &GenerationRequest,
        telemetry: TelemetryKind,
    ) -> Result<Generation, ChatError> {
        let provider = self.settings.provider;
        let adapter = provider.adapter();
        let endpoint = Endpoint {
            base_url: self.settings.base_url(provider),
            model: self.settings.model.clone(),
            api_key: api_key.to_string(),
        };

        self.events
            .send_important(ChatEvent::TurnStarted { index, regenerate })
            .await;

        let cancel = self.stop.begin();
        let mut session = GenerationSession::new(adapter, cancel, self.settings.watchdog);
        tracing::info!(
            session_id = %session.id(),
            provider = provider.id(),
            model = %endpoint.model,
            %mode,
            regenerate,
            "Starting generation"
        );

        let transcript = &mut self.transcript;
        let events = &self.events;
        let outcome = match session.build(request, &endpoint) {
            Ok(http_request) => {
                session
                    .run(&self.http, http_request, |event| match event {
                        SessionEvent::Delta(text) => {
                            if transcript.apply_delta(&text) {
                                events.send_delta(ChatEvent::AssistantDelta { index, text });
                            }
                        }
                        SessionEvent::TakingLong(active) => {
                            events.send_delta(ChatEvent::TakingLong { active });
                        }
                    })
                    .await
            }
            Err(err) => SessionOutcome::Failed(err),
        };
        self.stop.end();

        let user_type = match mode {
            CredentialMode::Shared => UserType::Trial,
            CredentialMode::Personal => UserType::Personal,
        };

        match outcome {
            SessionOutcome::Completed | SessionOutcome::Cancelled => {
                let state = outcome.state();
                let content = self
                    .transcript
                    .finalize()
                    .map(|message| message.content.clone())
                    .unwrap_or_default();

                if state == SessionState::Completed {
                    if regenerate {
                        self.allocator.report_regeneration_success();
                    } else {
                        self.allocator.report_success(mode);
                    }
                    self.events
                        .send_important(ChatEvent::Completed {
                            index,
                            text: content.clone(),
                        })
                        .await;
                    self.log_event(telemetry, "completed".to_string(), user_type);
                } else {
                    self.events
                        .send_important(ChatEvent::Cancelled {
                            index,
                            partial_content: content.clone(),
                        })
                        .await;
                    self.log_event(telemetry, "cancelled".to_string(), user_type);
                }
                self.persist_transcript();

                Ok(Generation {
                    index,
                    content,
                    state,
                })
            }
            SessionOutcome::Failed(err) => {
                if regenerate {
                    self.transcript.restore_regenerated()?;
                } else {
                    self.transcript.rollback_last_exchange()?;
                }
                self.allocator.report_failure(mode);
                self.persist_transcript();

                self.events
                    .send_important(ChatEvent::Failed {
                        kind: err.kind.clone(),
                        message: err.message.clone(),
                        details: err.details.clone(),
                    })
                    .await;
                self.log_event(telemetry, format!("failed: {}", err.message), user_type);

                Err(ChatError::from(err))
            }
        }
    }

    fn log_event(&mut self, kind: TelemetryKind, details: String, user_type: UserType) {
        while self.telemetry.try_join_next().is_some() {}
        let event = TelemetryEvent {
            kind,
            assistant: self.settings.assistant.clone(),
            details,
            user_type,
        };
        self.backend.log_event(event, &mut self.telemetry);
    }

    fn persist_transcript(&self) {
        if let Err(err) = store::save_transcript(
            self.store.as_ref(),
            &self.settings.assistant,
            self.transcript.messages(),
        ) {
            tracing::warn!(error = %format!("{err:#}"), "Failed to save transcript");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_channel;
    use crate::store::MemoryStore;

    fn controller(model: &str) -> ChatController {
        let config = Config {
            provider: "openai".to_string(),
            model: Some(model.to_string()),
            ..Config::default()
        };
        let settings = ChatSettings::from_config(&config).unwrap();
        let (tx, _rx) = create_event_channel();
        let http = reqwest::Client::new();
        ChatController::new(
            settings,
            http.clone(),
            BackendClient::new(http, None),
            Arc::new(MemoryStore::new()),
            EventSender::new(tx),
        )
    }

    #[tokio::test]
    async fn image_attachment_on_text_only_model_is_rejected_early() {
        let mut chat = controller("gpt-3.5-turbo");
        let image = Arc::new(Attachment::new("image/png", "AQID"));

        let err = chat.send("look", vec![image]).await.unwrap_err();

        assert_eq!(
            err,
            ChatError::VisionUnsupported {
                model: "gpt-3.5-turbo".to_string()
            }
        );
        assert!(chat.messages().is_empty());
    }

    #[tokio::test]
    async fn missing_personal_key_leaves_transcript_untouched() {
        let mut chat = controller("gpt-4o");
        chat.allocator.set_personal_key(ProviderKind::OpenAI, "");

        let err = chat.send("hello", Vec::new()).await.unwrap_err();

        assert!(matches!(err, ChatError::Credential(_)));
        assert!(chat.messages().is_empty());
    }

    #[tokio::test]
    async fn regenerate_on_empty_transcript_reports_no_prompt() {
        let mut chat = controller("gpt-4o");
        let err = chat.regenerate(None).await.unwrap_err();
        assert_eq!(err.to_string(), "no preceding prompt");
    }

    #[test]
    fn grounding_is_dropped_for_vendors_without_tools() {
        let config = |provider: &str| Config {
            provider: provider.to_string(),
            grounding: true,
            ..Config::default()
        };
        let gemini = ChatSettings::from_config(&config("gemini")).unwrap();
        let openai = ChatSettings::from_config(&config("openai")).unwrap();

        assert!(gemini.grounding_enabled());
        assert!(!openai.grounding_enabled());
    }

    #[tokio::test]
    async fn flush_without_telemetry_returns_at_once() {
        let mut chat = controller("gpt-4o");
        assert_eq!(chat.flush_telemetry(Duration::from_millis(10)).await, 0);
    }

    #[test]
    fn stop_handle_without_session_is_noop() {
        let chat = controller("gpt-4o");
        let handle = chat.stop_handle();
        assert!(!handle.is_active());
        assert!(!handle.stop());
    }
}
