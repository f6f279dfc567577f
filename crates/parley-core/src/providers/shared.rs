//! Provider-agnostic types shared across LLM backends.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transcript::{Attachment, Message, Role};

/// Standard User-Agent header for parley API requests.
pub const USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Config resolution helpers
// ============================================================================

/// Resolves an API key with precedence: config > env.
///
/// Returns `None` when neither source yields a non-empty key.
pub fn resolve_api_key(config_api_key: Option<&str>, env_var: &str) -> Option<String> {
    if let Some(key) = config_api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    std::env::var(env_var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolves a base URL with precedence: env > config > default.
///
/// # Errors
/// Returns an error if the env or config value is not a valid URL.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    provider_name: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    if let Some(config_url) = config_base_url {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str, provider_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {provider_name} base URL: {url}"))?;
    Ok(())
}

// ============================================================================
// Canonical request
// ============================================================================

/// One part of a canonical turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    /// Attachment shared with the transcript, never copied.
    InlineData(Arc<Attachment>),
}

/// A vendor-neutral conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                Part::InlineData(_) => None,
            })
            .collect()
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Arc<Attachment>> {
        self.parts.iter().filter_map(|part| match part {
            Part::InlineData(attachment) => Some(attachment),
            Part::Text(_) => None,
        })
    }
}

/// Canonical, vendor-neutral generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub turns: Vec<Turn>,
    pub system_prompt: String,
    /// Web grounding / tool capability.
    pub grounding: bool,
    pub max_tokens: u32,
}

impl GenerationRequest {
    /// Builds a request from the transcript slice preceding the target message.
    ///
    /// System-role messages are folded into the system prompt. Turns without
    /// text or attachments are skipped.
    pub fn from_history(
        history: &[Message],
        system_prompt: &str,
        grounding: bool,
        max_tokens: u32,
    ) -> Self {
        let mut system = system_prompt.trim().to_string();
        let mut turns = Vec::with_capacity(history.len());

        for message in history {
            if message.role == Role::System {
                let extra = message.content.trim();
                if !extra.is_empty() {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(extra);
                }
                continue;
            }

            let mut parts = Vec::with_capacity(message.attachments.len() + 1);
            parts.extend(
                message
                    .attachments
                    .iter()
                    .map(|attachment| Part::InlineData(Arc::clone(attachment))),
            );
            if !message.content.is_empty() {
                parts.push(Part::Text(message.content.clone()));
            }
            if parts.is_empty() {
                continue;
            }
            turns.push(Turn {
                role: message.role,
                parts,
            });
        }

        Self {
            turns,
            system_prompt: system,
            grounding,
            max_tokens,
        }
    }
}

/// Wire-level request produced by an adapter.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn into_builder(self, http: &reqwest::Client) -> reqwest::RequestBuilder {
        let builder = http.request(self.method, &self.url).headers(self.headers);
        match self.body {
            Some(body) => builder.json(&body),
            None => builder,
        }
    }
}

// ============================================================================
// Stream events and errors
// ============================================================================

/// Canonical event decoded from one vendor frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// Frame carries nothing the transcript needs (pings, usage, block starts).
    Ignorable,
    /// Vendor-specific terminal marker.
    Done,
    /// Error reported inside the stream by the vendor.
    Error { error_type: String, message: String },
}

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection failure, timeout or broken body stream
    Network,
    /// Failed to parse a frame (JSON parse error)
    Parse,
    /// API-level error returned by the provider mid-stream
    ApiError,
    /// The request could not be assembled (e.g. a key unusable as a header)
    InvalidRequest,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Network => write!(f, "network"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
            ProviderErrorKind::InvalidRequest => write!(f, "invalid_request"),
        }
    }
}

/// Structured error from the provider with kind and details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// HTTP status, when the error came from one
    pub status: Option<u16>,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    /// Creates an HTTP status error, preferring the vendor's own message.
    pub fn http_status(status: u16, body: &str) -> Self {
        let message = extract_error_message(body)
            .unwrap_or_else(|| format!("request failed with status {status}"));
        Self {
            kind: ProviderErrorKind::HttpStatus,
            message,
            status: Some(status),
            details: (!body.trim().is_empty()).then(|| body.to_string()),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Parse, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    /// Creates an API error (from a mid-stream error frame).
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self::new(ProviderErrorKind::ApiError, format!("{error_type}: {message}"))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Header value for a credential. The key itself never appears in the error.
///
/// # Errors
/// Returns `InvalidRequest` when the value has characters HTTP headers reject.
pub fn credential_header(value: &str) -> ProviderResult<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        ProviderError::invalid_request("API key contains characters not allowed in HTTP headers")
    })?;
    header.set_sensitive(true);
    Ok(header)
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        classify_reqwest_error(&e)
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Pulls a human-readable message out of a vendor error body.
///
/// Handles `{"error": {"message": ..}}`, `{"error": "text"}`, `{"message": ..}`
/// and Gemini's array-wrapped `[{"error": {..}}]`.
pub fn extract_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body.trim()).ok()?;
    let value = match value {
        Value::Array(items) => items.into_iter().next()?,
        other => other,
    };

    let message = match value.get("error") {
        Some(Value::String(text)) => Some(text.as_str()),
        Some(error) => error.get("message").and_then(Value::as_str),
        None => value.get("message").and_then(Value::as_str),
    }?;

    let trimmed = message.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Classifies a reqwest error into a `ProviderError`.
pub fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::network(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::network(format!("Connection failed: {e}"))
    } else if e.is_body() || e.is_decode() {
        ProviderError::network(format!("Response stream interrupted: {e}"))
    } else {
        ProviderError::network(format!("Network error: {e}"))
    }
}
