//! Credential allocation: personal keys and the shared trial key.
//!
//! Personal keys must have been probed valid before use. Shared mode hands out
//! one sticky trial key per process, re-fetched only after a failure, and
//! counts successful generations against a persisted quota.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::providers::{Adapter, ProviderKind};
use crate::store::{KvStore, KvStoreExt, keys};

/// Default debounce before a key edit is probed.
pub const DEFAULT_VALIDATION_DEBOUNCE: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    #[default]
    Personal,
    Shared,
}

impl CredentialMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialMode::Personal => "personal",
            CredentialMode::Shared => "shared",
        }
    }
}

impl fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "personal" => Ok(CredentialMode::Personal),
            "shared" | "trial" => Ok(CredentialMode::Shared),
            other => Err(format!(
                "unknown mode '{other}' (expected 'personal' or 'shared')"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Unchecked,
    Checking,
    Valid,
    Invalid,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            KeyStatus::Unchecked => "unchecked",
            KeyStatus::Checking => "checking",
            KeyStatus::Valid => "valid",
            KeyStatus::Invalid => "invalid",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("no valid API key for {provider}; add one or check it first")]
    MissingOrInvalidKey { provider: &'static str },
    #[error("shared mode is only available for {trial_provider}")]
    SharedModeUnavailable { trial_provider: &'static str },
    #[error("trial quota exhausted; add a personal API key to continue")]
    QuotaExhausted,
    #[error("could not obtain a trial key: {0}")]
    Issuance(String),
}

/// A key ready for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredKey {
    pub key: String,
    pub label: Option<String>,
    pub mode: CredentialMode,
}

/// Trial key handed out by the issuance collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedKey {
    pub api_key: String,
    pub key_label: Option<String>,
}

/// Source of shared trial keys.
pub trait KeyIssuer {
    fn issue_trial_key(&self) -> impl Future<Output = anyhow::Result<IssuedKey>> + Send;
}

/// Outcome of one key probe, applied only if the key is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatusUpdate {
    pub provider: ProviderKind,
    pub key: String,
    pub status: KeyStatus,
}

#[derive(Debug, Clone)]
struct PersonalKey {
    key: String,
    status: KeyStatus,
}

#[derive(Debug, Clone)]
struct StickyKey {
    key: String,
    label: Option<String>,
}

pub struct CredentialAllocator {
    store: Arc<dyn KvStore>,
    trial_provider: ProviderKind,
    personal: HashMap<ProviderKind, PersonalKey>,
    sticky: Option<StickyKey>,
    key_label: Option<String>,
    remaining_uses: u32,
    lifetime_generations: u64,
}

impl CredentialAllocator {
    /// Creates an allocator, restoring counters from `store`.
    ///
    /// `initial_trial_uses` applies only when no count was persisted yet.
    pub fn new(
        store: Arc<dyn KvStore>,
        trial_provider: ProviderKind,
        initial_trial_uses: u32,
    ) -> Self {
        let remaining_uses = store
            .get_as::<u32>(keys::TRIAL_REMAINING_USES)
            .unwrap_or(initial_trial_uses);
        let key_label = store.get_as::<String>(keys::TRIAL_KEY_LABEL);
        let lifetime_generations = store
            .get_as::<u64>(keys::LIFETIME_GENERATIONS)
            .unwrap_or(0);

        Self {
            store,
            trial_provider,
            personal: HashMap::new(),
            sticky: None,
            key_label,
            remaining_uses,
            lifetime_generations,
        }
    }

    pub fn trial_provider(&self) -> ProviderKind {
        self.trial_provider
    }

    pub fn remaining_uses(&self) -> u32 {
        self.remaining_uses
    }

    pub fn key_label(&self) -> Option<&str> {
        self.key_label.as_deref()
    }

    pub fn has_sticky_key(&self) -> bool {
        self.sticky.is_some()
    }

    pub fn lifetime_generations(&self) -> u64 {
        self.lifetime_generations
    }

    pub fn personal_key(&self, provider: ProviderKind) -> Option<&str> {
        self.personal.get(&provider).map(|entry| entry.key.as_str())
    }

    pub fn key_status(&self, provider: ProviderKind) -> KeyStatus {
        self.personal
            .get(&provider)
            .map_or(KeyStatus::Unchecked, |entry| entry.status)
    }

    /// Records a personal key edit. A changed key goes back to `Unchecked`.
    pub fn set_personal_key(&mut self, provider: ProviderKind, key: &str) {
        let key = key.trim();
        if key.is_empty() {
            self.personal.remove(&provider);
            return;
        }
        match self.personal.get_mut(&provider) {
            Some(entry) if entry.key == key => {}
            _ => {
                self.personal.insert(
                    provider,
                    PersonalKey {
                        key: key.to_string(),
                        status: KeyStatus::Unchecked,
                    },
                );
            }
        }
    }

    /// Applies a probe result. Returns `false` if the key changed meanwhile.
    pub fn apply_status(&mut self, update: &KeyStatusUpdate) -> bool {
        match self.personal.get_mut(&update.provider) {
            Some(entry) if entry.key == update.key => {
                entry.status = update.status;
                true
            }
            _ => false,
        }
    }

    /// Resolves the key for one session.
    ///
    /// # Errors
    /// Returns a `CredentialError` before any generation request is made.
    pub async fn acquire<I: KeyIssuer>(
        &mut self,
        provider: ProviderKind,
        mode: CredentialMode,
        issuer: &I,
    ) -> Result<AcquiredKey, CredentialError> {
        match mode {
            CredentialMode::Personal => match self.personal.get(&provider) {
                Some(entry) if entry.status == KeyStatus::Valid => Ok(AcquiredKey {
                    key: entry.key.clone(),
                    label: None,
                    mode,
                }),
                _ => Err(CredentialError::MissingOrInvalidKey {
                    provider: provider.label(),
                }),
            },
            CredentialMode::Shared => {
                if provider != self.trial_provider {
                    return Err(CredentialError::SharedModeUnavailable {
                        trial_provider: self.trial_provider.label(),
                    });
                }
                if self.remaining_uses == 0 {
                    return Err(CredentialError::QuotaExhausted);
                }
                if let Some(sticky) = &self.sticky {
                    return Ok(AcquiredKey {
                        key: sticky.key.clone(),
                        label: sticky.label.clone(),
                        mode,
                    });
                }

                let issued = issuer
                    .issue_trial_key()
                    .await
                    .map_err(|err| CredentialError::Issuance(format!("{err:#}")))?;
                tracing::info!(label = ?issued.key_label, "Fetched trial key");

                self.key_label.clone_from(&issued.key_label);
                self.persist_label();
                self.sticky = Some(StickyKey {
                    key: issued.api_key.clone(),
                    label: issued.key_label.clone(),
                });
                Ok(AcquiredKey {
                    key: issued.api_key,
                    label: issued.key_label,
                    mode,
                })
            }
        }
    }

    /// Invalidates the sticky trial key after a failed session.
    pub fn report_failure(&mut self, mode: CredentialMode) {
        if mode == CredentialMode::Shared {
            self.sticky = None;
            self.key_label = None;
            self.persist_label();
        }
    }

    /// Counts a successful fresh generation.
    pub fn report_success(&mut self, mode: CredentialMode) {
        if mode == CredentialMode::Shared {
            self.remaining_uses = self.remaining_uses.saturating_sub(1);
            self.persist(keys::TRIAL_REMAINING_USES, &self.remaining_uses);
        }
        self.bump_lifetime();
    }

    /// Counts a successful regeneration; trial quota is untouched.
    pub fn report_regeneration_success(&mut self) {
        self.bump_lifetime();
    }

    fn bump_lifetime(&mut self) {
        self.lifetime_generations += 1;
        self.persist(keys::LIFETIME_GENERATIONS, &self.lifetime_generations);
    }

    fn persist_label(&self) {
        let result = match &self.key_label {
            Some(label) => self.store.set_as(keys::TRIAL_KEY_LABEL, label),
            None => self.store.remove(keys::TRIAL_KEY_LABEL),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "Failed to persist trial key label");
        }
    }

    fn persist<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(err) = self.store.set_as(key, value) {
            tracing::warn!(key, error = %err, "Failed to persist credential state");
        }
    }
}

/// Probes `key` once against the provider.
pub async fn check_key(
    http: &reqwest::Client,
    provider: ProviderKind,
    base_url: &str,
    key: &str,
) -> KeyStatus {
    let adapter: Adapter = provider.adapter();
    let model = provider.provider().default_model().name;
    let request = match adapter.probe_request(base_url, model, key) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(provider = provider.id(), error = %err, "Key check not sent");
            return KeyStatus::Invalid;
        }
    };

    match request.into_builder(http).send().await {
        Ok(response) if response.status().is_success() => KeyStatus::Valid,
        Ok(response) => {
            tracing::debug!(
                provider = provider.id(),
                status = %response.status(),
                "Key probe rejected"
            );
            KeyStatus::Invalid
        }
        Err(err) => {
            tracing::warn!(provider = provider.id(), error = %err, "Key probe failed");
            KeyStatus::Invalid
        }
    }
}

/// Debounced key probing, one pending probe per provider.
pub struct KeyValidator {
    http: reqwest::Client,
    debounce: Duration,
    updates: mpsc::Sender<KeyStatusUpdate>,
    pending: HashMap<ProviderKind, CancellationToken>,
}

impl KeyValidator {
    pub fn new(
        http: reqwest::Client,
        debounce: Duration,
        updates: mpsc::Sender<KeyStatusUpdate>,
    ) -> Self {
        Self {
            http,
            debounce,
            updates,
            pending: HashMap::new(),
        }
    }

    /// Schedules a probe for `key`, cancelling any pending probe for the
    /// same provider. Reports `Checking` immediately, then the result.
    pub fn schedule(&mut self, provider: ProviderKind, key: &str, base_url: &str) {
        if let Some(previous) = self.pending.remove(&provider) {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        self.pending.insert(provider, cancel.clone());

        let http = self.http.clone();
        let updates = self.updates.clone();
        let debounce = self.debounce;
        let key = key.trim().to_string();
        let base_url = base_url.to_string();

        tokio::spawn(async move {
            let update = |status| KeyStatusUpdate {
                provider,
                key: key.clone(),
                status,
            };
            if updates.send(update(KeyStatus::Checking)).await.is_err() {
                return;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(debounce) => {}
            }

            let status = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                status = check_key(&http, provider, &base_url, &key) => status,
            };
            if updates.send(update(status)).await.is_err() {
                tracing::debug!(
                    provider = provider.id(),
                    ?status,
                    "Key check finished after its receiver closed"
                );
            }
        });
    }

    /// Cancels every pending probe.
    pub fn cancel_all(&mut self) {
        for (_, token) in self.pending.drain() {
            token.cancel();
        }
    }
}

impl Drop for KeyValidator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
