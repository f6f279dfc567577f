//! Anthropic Messages API adapter.

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Endpoint;
use super::shared::{
    GenerationRequest, HttpRequest, Part, ProviderError, ProviderResult, StreamEvent, USER_AGENT,
    credential_header,
};

/// Default base URL for the Anthropic API.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";

/// Image types the Messages API accepts as base64 sources.
const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ApiContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

/// # Errors
/// Returns `InvalidRequest` when the key cannot be sent as a header.
pub fn build_request(
    request: &GenerationRequest,
    endpoint: &Endpoint,
) -> ProviderResult<HttpRequest> {
    let messages: Vec<ApiMessage> = request
        .turns
        .iter()
        .filter_map(|turn| {
            let content: Vec<ApiContentBlock> = turn
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text(text) => Some(ApiContentBlock::Text { text: text.clone() }),
                    Part::InlineData(attachment)
                        if IMAGE_TYPES.contains(&attachment.mime_type.as_str()) =>
                    {
                        Some(ApiContentBlock::Image {
                            source: ImageSource {
                                source_type: "base64",
                                media_type: attachment.mime_type.clone(),
                                data: attachment.base64_data.clone(),
                            },
                        })
                    }
                    Part::InlineData(_) => None,
                })
                .collect();
            (!content.is_empty()).then(|| ApiMessage {
                role: turn.role.as_str(),
                content,
            })
        })
        .collect();

    let mut body = json!({
        "model": endpoint.model,
        "max_tokens": request.max_tokens,
        "messages": messages,
        "stream": true,
    });
    if !request.system_prompt.is_empty() {
        body["system"] = json!(request.system_prompt);
    }

    Ok(HttpRequest {
        method: Method::POST,
        url: format!("{}/v1/messages", endpoint.base_url),
        headers: build_headers(&endpoint.api_key)?,
        body: Some(body),
    })
}

/// A one-token, non-streaming completion.
///
/// # Errors
/// Returns `InvalidRequest` when the key cannot be sent as a header.
pub fn probe_request(base_url: &str, model: &str, api_key: &str) -> ProviderResult<HttpRequest> {
    let mut headers = build_headers(api_key)?;
    headers.insert("accept", HeaderValue::from_static("application/json"));
    Ok(HttpRequest {
        method: Method::POST,
        url: format!("{base_url}/v1/messages"),
        headers,
        body: Some(json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        })),
    })
}

#[derive(Debug, Deserialize)]
struct SseFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    error: Option<SseErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseErrorInfo {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Decodes one `data:` payload. `message_stop` is the terminal frame.
///
/// # Errors
/// Returns a `Parse` error when the payload is not a typed JSON frame.
pub fn parse_frame(data: &str) -> ProviderResult<StreamEvent> {
    let frame: SseFrame = serde_json::from_str(data.trim())
        .map_err(|err| ProviderError::parse(format!("Failed to parse Anthropic frame: {err}")))?;

    match frame.frame_type.as_str() {
        "content_block_delta" => match frame.delta {
            Some(SseDelta {
                delta_type,
                text: Some(text),
            }) if delta_type.as_deref() == Some("text_delta") && !text.is_empty() => {
                Ok(StreamEvent::TextDelta(text))
            }
            _ => Ok(StreamEvent::Ignorable),
        },
        "message_stop" => Ok(StreamEvent::Done),
        "error" => {
            let error = frame
                .error
                .ok_or_else(|| ProviderError::parse("Missing data for error event"))?;
            Ok(StreamEvent::Error {
                error_type: error.error_type,
                message: error.message,
            })
        }
        _ => Ok(StreamEvent::Ignorable),
    }
}

fn build_headers(api_key: &str) -> ProviderResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-api-key",
        credential_header(api_key)?,
    );
    headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::shared::Turn;
    use crate::transcript::{Attachment, Role};

    fn endpoint() -> Endpoint {
        Endpoint {
            base_url: "http://localhost:9".to_string(),
            model: "claude-haiku-4-5".to_string(),
            api_key: "sk-ant".to_string(),
        }
    }

    #[test]
    fn system_prompt_is_a_separate_field() {
        let request = GenerationRequest {
            turns: vec![Turn {
                role: Role::User,
                parts: vec![Part::Text("hi".to_string())],
            }],
            system_prompt: "Be brief.".to_string(),
            grounding: false,
            max_tokens: 300,
        };
        let http = build_request(&request, &endpoint()).unwrap();
        let body = http.body.unwrap();

        assert_eq!(http.url, "http://localhost:9/v1/messages");
        assert_eq!(http.headers["x-api-key"], "sk-ant");
        assert_eq!(http.headers["anthropic-version"], API_VERSION);
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn images_become_base64_blocks_and_others_are_dropped() {
        let request = GenerationRequest {
            turns: vec![Turn {
                role: Role::User,
                parts: vec![
                    Part::InlineData(Arc::new(Attachment::new("image/webp", "UklG"))),
                    Part::InlineData(Arc::new(Attachment::new("text/csv", "YSxi"))),
                    Part::Text("describe".to_string()),
                ],
            }],
            system_prompt: String::new(),
            grounding: false,
            max_tokens: 10,
        };
        let body = build_request(&request, &endpoint()).unwrap().body.unwrap();
        let content = body["messages"][0]["content"].as_array().unwrap();

        assert!(body.get("system").is_none());
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["type"], "base64");
        assert_eq!(content[0]["source"]["media_type"], "image/webp");
        assert_eq!(content[1]["type"], "text");
    }

    #[test]
    fn parse_frame_text_delta_stop_and_ping() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(
            parse_frame(delta).unwrap(),
            StreamEvent::TextDelta("Hello".to_string())
        );
        assert_eq!(
            parse_frame(r#"{"type":"ping"}"#).unwrap(),
            StreamEvent::Ignorable
        );
        assert_eq!(
            parse_frame(r#"{"type":"message_stop"}"#).unwrap(),
            StreamEvent::Done
        );
        let thinking = r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#;
        assert_eq!(parse_frame(thinking).unwrap(), StreamEvent::Ignorable);
    }

    #[test]
    fn parse_frame_error_event() {
        let frame = r#"{"type":"error","error":{"type":"overloaded_error","message":"API is temporarily overloaded"}}"#;
        assert_eq!(
            parse_frame(frame).unwrap(),
            StreamEvent::Error {
                error_type: "overloaded_error".to_string(),
                message: "API is temporarily overloaded".to_string(),
            }
        );
    }

    #[test]
    fn probe_is_a_one_token_completion() {
        let probe = probe_request("http://localhost:9", "claude-haiku-4-5", "sk-ant").unwrap();
        let body = probe.body.unwrap();
        assert_eq!(probe.method, Method::POST);
        assert_eq!(body["max_tokens"], 1);
        assert!(body.get("stream").is_none());
    }
}
