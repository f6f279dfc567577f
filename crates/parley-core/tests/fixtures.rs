//! Stream fixture helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::ResponseTemplate;

/// Gemini SSE body with one frame per chunk.
pub fn gemini_sse(chunks: &[&str]) -> String {
    chunks
        .iter()
        .map(|chunk| {
            let frame = json!({
                "candidates": [{ "content": { "role": "model", "parts": [{ "text": chunk }] } }]
            });
            format!("data: {frame}\r\n\r\n")
        })
        .collect()
}

/// Wrap SSE body string in a ResponseTemplate.
pub fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

/// Convenience: Gemini text chunks wrapped in a ResponseTemplate.
pub fn gemini_response(chunks: &[&str]) -> ResponseTemplate {
    sse_response(&gemini_sse(chunks))
}

pub fn trial_key_response(api_key: &str, label: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "apiKey": api_key,
        "keyLabel": label,
    }))
}

/// How a [`partial_sse_server`] response ends after its frames.
#[derive(Debug, Clone, Copy)]
pub enum BodyEnd {
    /// Keep the connection open without sending more.
    Stall,
    /// Cut the connection in the middle of a chunk.
    Cut,
}

/// Serves one chunked SSE response that never finishes cleanly.
///
/// Returns the base URL. wiremock only sends complete bodies, so this writes
/// `body` as a single chunk and then stalls or cuts the connection.
pub async fn partial_sse_server(body: String, end: BodyEnd) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request(&mut socket).await;

        let head = concat!(
            "HTTP/1.1 200 OK\r\n",
            "content-type: text/event-stream\r\n",
            "transfer-encoding: chunked\r\n\r\n",
        );
        let chunk = format!("{:x}\r\n{body}\r\n", body.len());
        if socket.write_all(head.as_bytes()).await.is_err()
            || socket.write_all(chunk.as_bytes()).await.is_err()
        {
            return;
        }
        let _ = socket.flush().await;

        match end {
            BodyEnd::Stall => tokio::time::sleep(Duration::from_secs(30)).await,
            BodyEnd::Cut => {
                let _ = socket.write_all(b"40\r\ndata: {\"cand").await;
                let _ = socket.flush().await;
                let _ = socket.shutdown().await;
            }
        }
    });

    format!("http://{addr}")
}

/// Reads one request (head and `content-length` body) off the socket.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(read) = socket.read(&mut chunk).await else {
            return;
        };
        if read == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..read]);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + body_len {
            return;
        }
    }
}

pub fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_sse_emits_one_frame_per_chunk() {
        let body = gemini_sse(&["Hel", "lo"]);
        assert_eq!(body.matches("data: ").count(), 2);
        assert!(body.contains(r#""text":"Hel""#));
    }
}
