//! OpenAI-compatible Chat Completions adapter (OpenAI, OpenRouter).

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};

use super::Endpoint;
use super::shared::{
    GenerationRequest, HttpRequest, Part, ProviderError, ProviderResult, StreamEvent, USER_AGENT,
    credential_header,
};

/// Default base URL for the OpenAI API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default base URL for the OpenRouter API.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Terminal payload of a chat completions stream.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: &'static str,
    content: ChatMessageContent,
}

/// Either a plain string or an array of content parts.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatMessageContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlData },
}

#[derive(Debug, Serialize)]
struct ImageUrlData {
    url: String,
}

/// # Errors
/// Returns `InvalidRequest` when the key cannot be sent as a header.
pub fn build_request(
    request: &GenerationRequest,
    endpoint: &Endpoint,
) -> ProviderResult<HttpRequest> {
    let mut messages = Vec::with_capacity(request.turns.len() + 1);

    if !request.system_prompt.is_empty() {
        messages.push(ChatCompletionMessage {
            role: "system",
            content: ChatMessageContent::Text(request.system_prompt.clone()),
        });
    }

    for turn in &request.turns {
        let mut parts = Vec::with_capacity(turn.parts.len());
        for part in &turn.parts {
            match part {
                Part::Text(text) => parts.push(ChatContentPart::Text { text: text.clone() }),
                // Non-image attachments have no chat-completions shape.
                Part::InlineData(attachment) if attachment.is_image() => {
                    parts.push(ChatContentPart::ImageUrl {
                        image_url: ImageUrlData {
                            url: format!(
                                "data:{};base64,{}",
                                attachment.mime_type, attachment.base64_data
                            ),
                        },
                    });
                }
                Part::InlineData(_) => {}
            }
        }

        let has_images = parts
            .iter()
            .any(|part| matches!(part, ChatContentPart::ImageUrl { .. }));
        let content = if has_images {
            ChatMessageContent::Parts(parts)
        } else {
            ChatMessageContent::Text(turn.text())
        };
        if let ChatMessageContent::Text(text) = &content
            && text.is_empty()
        {
            continue;
        }

        messages.push(ChatCompletionMessage {
            role: turn.role.as_str(),
            content,
        });
    }

    let body = json!({
        "model": endpoint.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "stream": true,
    });

    Ok(HttpRequest {
        method: Method::POST,
        url: format!("{}/chat/completions", endpoint.base_url),
        headers: build_headers(&endpoint.api_key)?,
        body: Some(body),
    })
}

/// # Errors
/// Returns `InvalidRequest` when the key cannot be sent as a header.
pub fn probe_request(base_url: &str, api_key: &str) -> ProviderResult<HttpRequest> {
    let mut headers = build_headers(api_key)?;
    headers.insert("accept", HeaderValue::from_static("application/json"));
    Ok(HttpRequest {
        method: Method::GET,
        url: format!("{base_url}/models"),
        headers,
        body: None,
    })
}

/// Decodes one `data:` payload (the `[DONE]` marker is handled by the reader).
///
/// # Errors
/// Returns a `Parse` error when the payload is not JSON.
pub fn parse_frame(data: &str) -> ProviderResult<StreamEvent> {
    let trimmed = data.trim();
    if trimmed == DONE_MARKER {
        return Ok(StreamEvent::Done);
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|err| {
        ProviderError::parse(format!("Failed to parse chat completion chunk: {err}"))
    })?;

    if let Some(error) = value.get("error") {
        let error_type = error
            .get("type")
            .or_else(|| error.get("code"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "error".to_string());
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("stream error");
        return Ok(StreamEvent::Error {
            error_type,
            message: message.to_string(),
        });
    }

    // Usage-only chunks carry no choices.
    match value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        Some(text) if !text.is_empty() => Ok(StreamEvent::TextDelta(text.to_string())),
        _ => Ok(StreamEvent::Ignorable),
    }
}

fn build_headers(api_key: &str) -> ProviderResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        credential_header(&format!("Bearer {api_key}"))?,
    );
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    Ok(headers)
}
