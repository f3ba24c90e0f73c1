// src/bin/chat_client.rs
//! Terminal chat client. Resolves a file (directly by id, or by polling a
//! storage key until the upload pipeline settles), then drives the chat
//! synchronization protocol against the server, rendering the answer as
//! it streams.
//!
//! Usage:
//!   chat_client <file_id>
//!   chat_client --key <storage_key>
//!
//! Environment: DOKU_URL (default http://localhost:3000), DOKU_SESSION_TOKEN.

use async_trait::async_trait;
use doku::models::message::MessagePageResponse;
use doku::sync::{run_submission, ChatSync, ChatTransport, TransportError, FIRST_PAGE_LIMIT};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::io::{BufRead, Write};
use std::time::Duration;

/// Fixed cadence for upload-status polling.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct HttpChatTransport {
    client: reqwest::Client,
    base_url: String,
    session_token: String,
}

impl HttpChatTransport {
    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.session_token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.session_token)
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send_message(
        &self,
        file_id: &str,
        message: &str,
    ) -> Result<BoxStream<'static, Result<String, TransportError>>, TransportError> {
        let response = self
            .post("/api/message")
            .json(&serde_json::json!({ "fileId": file_id, "message": message }))
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError(format!("server returned {}", status)));
        }

        // Network chunks can split a UTF-8 character; carry the incomplete
        // tail over to the next chunk instead of mangling it.
        let mut tail: Vec<u8> = Vec::new();
        let stream = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    tail.extend_from_slice(&bytes);
                    Ok(take_complete_utf8(&mut tail))
                }
                Err(e) => Err(TransportError(e.to_string())),
            })
            .filter(|chunk| {
                let keep = !matches!(chunk, Ok(s) if s.is_empty());
                async move { keep }
            })
            .boxed();

        Ok(stream)
    }

    async fn fetch_first_page(
        &self,
        file_id: &str,
        limit: i64,
    ) -> Result<MessagePageResponse, TransportError> {
        let response = self
            .get(&format!("/api/files/{}/messages?limit={}", file_id, limit))
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError(format!("server returned {}", status)));
        }

        response
            .json::<MessagePageResponse>()
            .await
            .map_err(|e| TransportError(e.to_string()))
    }
}

/// Splits off the longest valid UTF-8 prefix of `buf`, leaving any
/// trailing incomplete sequence in place.
fn take_complete_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let out = s.to_string();
            buf.clear();
            out
        }
        Err(e) => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&buf[..valid]).to_string();
            buf.drain(..valid);
            out
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: chat_client <file_id> | chat_client --key <storage_key>");
        std::process::exit(2);
    }

    let base_url = std::env::var("DOKU_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let session_token = match std::env::var("DOKU_SESSION_TOKEN") {
        Ok(token) => token,
        Err(_) => {
            eprintln!("DOKU_SESSION_TOKEN must be set");
            std::process::exit(2);
        }
    };

    let transport = HttpChatTransport {
        client: reqwest::Client::new(),
        base_url,
        session_token,
    };

    let file_id = if args[0] == "--key" {
        let Some(key) = args.get(1) else {
            eprintln!("--key requires a storage key");
            std::process::exit(2);
        };
        resolve_file_by_key(&transport, key).await
    } else {
        args[0].clone()
    };

    wait_until_processed(&transport, &file_id).await;

    let mut sync = ChatSync::new();

    // Initial history, from the source of truth.
    let epoch = sync.begin_refresh();
    match transport.fetch_first_page(&file_id, FIRST_PAGE_LIMIT).await {
        Ok(page) => {
            sync.apply_refresh(epoch, page);
        }
        Err(e) => {
            eprintln!("failed to load chat history: {}", e);
            std::process::exit(1);
        }
    }

    for entry in sync.entries().iter().rev() {
        let speaker = if entry.is_user_message() { "you" } else { "doku" };
        println!("{}: {}", speaker, entry.text());
    }

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() || line == "/quit" {
            break;
        }

        sync.set_draft(line);
        print!("doku: ");
        std::io::stdout().flush().ok();

        let result = run_submission(&mut sync, &transport, &file_id, |delta| {
            print!("{}", delta);
            std::io::stdout().flush().ok();
        })
        .await;
        println!();

        if result.is_err() {
            eprintln!("(a submission is already in flight)");
        } else if !sync.draft().is_empty() {
            // Rollback put the question back in the input.
            eprintln!("(message failed to send; press enter to retry: {})", sync.draft());
        }
    }
}

/// The storage key becomes visible as a file row only once the upload
/// webhook has landed; poll for it on the fixed interval.
async fn resolve_file_by_key(transport: &HttpChatTransport, key: &str) -> String {
    println!("waiting for upload {} to register...", key);
    loop {
        let response = transport
            .post("/api/files/by-key")
            .json(&serde_json::json!({ "key": key }))
            .send()
            .await;

        if let Ok(response) = response {
            if response.status().is_success() {
                if let Ok(body) = response.json::<serde_json::Value>().await {
                    if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
                        return id.to_string();
                    }
                }
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Polls upload status until the pipeline settles. FAILED is terminal.
async fn wait_until_processed(transport: &HttpChatTransport, file_id: &str) {
    loop {
        let status = transport
            .get(&format!("/api/files/{}/status", file_id))
            .send()
            .await;

        if let Ok(response) = status {
            if let Ok(body) = response.json::<serde_json::Value>().await {
                match body.get("status").and_then(|v| v.as_str()) {
                    Some("SUCCESS") => return,
                    Some("FAILED") => {
                        eprintln!("upload processing failed (page limit or unreadable PDF)");
                        std::process::exit(1);
                    }
                    _ => {}
                }
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
