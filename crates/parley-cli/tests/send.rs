//! Integration tests for one-shot `send`.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

fn gemini_sse(chunks: &[&str]) -> String {
    chunks
        .iter()
        .map(|chunk| {
            let frame = json!({ "candidates": [{ "content": { "parts": [{ "text": chunk }] } }] });
            format!("data: {frame}\n\n")
        })
        .collect()
}

#[test]
fn test_send_without_key_fails_before_any_request() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env_remove("GEMINI_API_KEY")
        .env_remove("PARLEY_PROVIDER")
        .env_remove("PARLEY_MODE")
        .args(["--provider", "gemini", "send", "-p", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no valid API key"));
}

#[tokio::test]
async fn test_send_streams_reply_to_stdout() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .and(header("x-goog-api-key", "test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/models/gemini-2\.5-flash:streamGenerateContent$"))
        .and(header("x-goog-api-key", "test-api-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(gemini_sse(&["Hello", " world"])),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("GEMINI_API_KEY", "test-api-key")
        .env("GEMINI_BASE_URL", mock_server.uri())
        .env_remove("PARLEY_PROVIDER")
        .env_remove("PARLEY_MODE")
        .args(["--provider", "gemini", "--mode", "personal", "send", "-p", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello world"));

    assert!(home.path().join("state.json").exists());
}
