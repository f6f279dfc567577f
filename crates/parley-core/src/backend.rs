//! Client for the hosted backend: trial key issuance, the prompt store and
//! usage telemetry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;

use crate::credentials::{IssuedKey, KeyIssuer};
use crate::providers::shared::USER_AGENT;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrialKeyResponse {
    #[serde(default)]
    success: bool,
    api_key: Option<String>,
    key_label: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    #[serde(default)]
    success: bool,
    prompt: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Generation,
    TrialGeneration,
    Regeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Personal,
    Trial,
}

/// One usage event, sent after a session reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: TelemetryKind,
    pub assistant: String,
    pub details: String,
    #[serde(rename = "userType")]
    pub user_type: UserType,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    issuer_url: Option<String>,
    prompts: Arc<Mutex<HashMap<String, String>>>,
}

impl BackendClient {
    pub fn new(http: reqwest::Client, issuer_url: Option<String>) -> Self {
        let issuer_url = issuer_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Self {
            http,
            issuer_url,
            prompts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.issuer_url.is_some()
    }

    fn issuer(&self) -> Result<&str> {
        self.issuer_url
            .as_deref()
            .ok_or_else(|| anyhow!("No issuer_url configured"))
    }

    fn action_url(&self, params: &[(&str, &str)]) -> Result<url::Url> {
        let base = self.issuer()?;
        url::Url::parse_with_params(base, params)
            .with_context(|| format!("Invalid issuer URL: {base}"))
    }

    /// Fetches a fresh shared trial key.
    ///
    /// # Errors
    /// Returns an error on transport failure or an unsuccessful reply.
    pub async fn get_trial_api_key(&self) -> Result<IssuedKey> {
        let url = self.action_url(&[("action", "getTrialApiKey")])?;
        let response: TrialKeyResponse = self
            .http
            .get(url)
            .header("user-agent", USER_AGENT)
            .send()
            .await
            .context("Key issuer unreachable")?
            .error_for_status()
            .context("Key issuer rejected the request")?
            .json()
            .await
            .context("Failed to parse key issuer response")?;

        match response {
            TrialKeyResponse {
                success: true,
                api_key: Some(api_key),
                key_label,
                ..
            } if !api_key.trim().is_empty() => Ok(IssuedKey {
                api_key,
                key_label,
            }),
            TrialKeyResponse { error, .. } => {
                bail!(error.unwrap_or_else(|| "no trial key available".to_string()))
            }
        }
    }

    /// Returns the system prompt for `assistant`, cached for the process lifetime.
    ///
    /// # Errors
    /// Returns an error when no issuer is configured or the store fails.
    pub async fn get_prompt(&self, assistant: &str) -> Result<String> {
        if let Some(prompt) = self.cached_prompt(assistant) {
            return Ok(prompt);
        }

        let url = self.action_url(&[("action", "getPrompt"), ("assistant", assistant)])?;
        let response: PromptResponse = self
            .http
            .get(url)
            .header("user-agent", USER_AGENT)
            .send()
            .await
            .context("Prompt store unreachable")?
            .error_for_status()
            .context("Prompt store rejected the request")?
            .json()
            .await
            .context("Failed to parse prompt store response")?;

        let prompt = match response {
            PromptResponse {
                success: true,
                prompt: Some(prompt),
                ..
            } => prompt,
            PromptResponse { error, .. } => bail!(
                error.unwrap_or_else(|| format!("no prompt for assistant '{assistant}'"))
            ),
        };

        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(assistant.to_string(), prompt.clone());
        Ok(prompt)
    }

    /// Resolves the system prompt, falling back to `default_prompt` when the
    /// store is unavailable.
    pub async fn resolve_prompt(&self, assistant: &str, default_prompt: &str) -> String {
        if !self.is_configured() {
            return default_prompt.to_string();
        }
        match self.get_prompt(assistant).await {
            Ok(prompt) => prompt,
            Err(err) => {
                tracing::warn!(
                    assistant,
                    error = %format!("{err:#}"),
                    "Using default system prompt"
                );
                default_prompt.to_string()
            }
        }
    }

    pub fn cached_prompt(&self, assistant: &str) -> Option<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(assistant)
            .cloned()
    }

    pub fn clear_prompt_cache(&self) {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Sends `event` on a task in `tasks`. Failures are logged, never returned.
    ///
    /// Returns `false` when no issuer is configured.
    pub fn log_event(&self, event: TelemetryEvent, tasks: &mut JoinSet<()>) -> bool {
        let Some(url) = self.issuer_url.clone() else {
            return false;
        };
        let http = self.http.clone();
        tasks.spawn(async move {
            let body = json!({ "action": "logEvent", "event": event });
            let result = http
                .post(&url)
                .header("user-agent", USER_AGENT)
                .json(&body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            if let Err(err) = result {
                tracing::warn!(kind = ?event.kind, error = %err, "Telemetry dropped");
            }
        });
        true
    }
}

impl KeyIssuer for BackendClient {
    async fn issue_trial_key(&self) -> Result<IssuedKey> {
        self.get_trial_api_key().await
    }
}
