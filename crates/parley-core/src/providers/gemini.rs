//! Gemini `streamGenerateContent` adapter (turn-based history).

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};

use super::Endpoint;
use super::shared::{
    GenerationRequest, HttpRequest, Part, ProviderError, ProviderResult, StreamEvent, USER_AGENT,
    credential_header,
};
use crate::transcript::Role;

/// Default base URL for the Gemini API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model reply to the synthetic system turn.
const SYSTEM_ACK: &str = "Understood.";

/// # Errors
/// Returns `InvalidRequest` when the key cannot be sent as a header.
pub fn build_request(
    request: &GenerationRequest,
    endpoint: &Endpoint,
) -> ProviderResult<HttpRequest> {
    let mut contents = Vec::with_capacity(request.turns.len() + 2);

    // Grounded requests go out unmodified: the system exchange would steer
    // the model away from calling the search tool.
    if !request.grounding && !request.system_prompt.is_empty() {
        contents.push(json!({
            "role": "user",
            "parts": [text_part(&request.system_prompt)],
        }));
        contents.push(json!({
            "role": "model",
            "parts": [text_part(SYSTEM_ACK)],
        }));
    }

    for turn in &request.turns {
        let parts: Vec<Value> = turn
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => text_part(text),
                Part::InlineData(attachment) => {
                    inline_data_part(&attachment.mime_type, &attachment.base64_data)
                }
            })
            .collect();
        contents.push(json!({
            "role": role_name(turn.role),
            "parts": parts,
        }));
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
        },
    });
    if request.grounding {
        body["tools"] = json!([{ "google_search": {} }]);
    }

    Ok(HttpRequest {
        method: Method::POST,
        url: format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            endpoint.base_url, endpoint.model
        ),
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

/// Decodes one `data:` payload.
///
/// # Errors
/// Returns a `Parse` error when the payload is not JSON.
pub fn parse_frame(data: &str) -> ProviderResult<StreamEvent> {
    let value: Value = serde_json::from_str(data.trim())
        .map_err(|err| ProviderError::parse(format!("Failed to parse Gemini frame: {err}")))?;

    if let Some(error) = value.get("error") {
        let error_type = error
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("error");
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Gemini stream error");
        return Ok(StreamEvent::Error {
            error_type: error_type.to_string(),
            message: message.to_string(),
        });
    }

    let Some(parts) = value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    else {
        return Ok(StreamEvent::Ignorable);
    };

    let text: String = parts
        .iter()
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        Ok(StreamEvent::Ignorable)
    } else {
        Ok(StreamEvent::TextDelta(text))
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    }
}

fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

fn inline_data_part(mime_type: &str, data: &str) -> Value {
    json!({
        "inlineData": {
            "mimeType": mime_type,
            "data": data,
        }
    })
}

fn build_headers(api_key: &str) -> ProviderResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-goog-api-key",
        credential_header(api_key)?,
    );
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
    use crate::transcript::Attachment;

    fn endpoint() -> Endpoint {
        Endpoint {
            base_url: "http://localhost:9".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key: "g-key".to_string(),
        }
    }

    fn request(grounding: bool) -> GenerationRequest {
        GenerationRequest {
            turns: vec![
                Turn {
                    role: Role::User,
                    parts: vec![Part::Text("hi".to_string())],
                },
                Turn {
                    role: Role::Assistant,
                    parts: vec![Part::Text("hello".to_string())],
                },
                Turn {
                    role: Role::User,
                    parts: vec![
                        Part::InlineData(Arc::new(Attachment::new("application/pdf", "JVBE"))),
                        Part::Text("summarize".to_string()),
                    ],
                },
            ],
            system_prompt: "Be terse.".to_string(),
            grounding,
            max_tokens: 512,
        }
    }

    #[test]
    fn system_prompt_becomes_leading_exchange() {
        let http = build_request(&request(false), &endpoint()).unwrap();
        let body = http.body.unwrap();
        let contents = body["contents"].as_array().unwrap();

        assert_eq!(contents.len(), 5);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "Be terse.");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[3]["role"], "model");
        assert!(body.get("tools").is_none());
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(
            http.url,
            "http://localhost:9/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(http.headers["x-goog-api-key"], "g-key");
    }

    #[test]
    fn grounding_drops_system_exchange_and_adds_search_tool() {
        let body = build_request(&request(true), &endpoint()).unwrap().body.unwrap();
        let contents = body["contents"].as_array().unwrap();

        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["parts"][0]["text"], "hi");
        assert_eq!(body["tools"], json!([{ "google_search": {} }]));
    }

    #[test]
    fn attachments_become_inline_data_parts() {
        let body = build_request(&request(false), &endpoint()).unwrap().body.unwrap();
        let last = &body["contents"][4]["parts"];

        assert_eq!(last[0]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(last[0]["inlineData"]["data"], "JVBE");
        assert_eq!(last[1]["text"], "summarize");
    }

    #[test]
    fn parse_frame_joins_text_parts_and_skips_thoughts() {
        let frame = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"plan","thought":true},{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(
            parse_frame(frame).unwrap(),
            StreamEvent::TextDelta("Hello".to_string())
        );
    }

    #[test]
    fn parse_frame_usage_only_is_ignorable() {
        let frame = r#"{"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":5}}"#;
        assert_eq!(parse_frame(frame).unwrap(), StreamEvent::Ignorable);
    }

    #[test]
    fn parse_frame_surfaces_error_payload() {
        let frame = r#"{"error":{"code":429,"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            parse_frame(frame).unwrap(),
            StreamEvent::Error {
                error_type: "RESOURCE_EXHAUSTED".to_string(),
                message: "Resource exhausted".to_string(),
            }
        );
    }

    #[test]
    fn parse_frame_rejects_malformed_json() {
        assert!(parse_frame("{malformed json").is_err());
    }

    #[test]
    fn probe_lists_models() {
        let probe = probe_request("http://localhost:9", "g-key").unwrap();
        assert_eq!(probe.method, Method::GET);
        assert_eq!(probe.url, "http://localhost:9/models");
        assert!(probe.body.is_none());
    }
}
