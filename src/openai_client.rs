// src/openai_client.rs
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenAiError {
    #[error("OpenAI API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("OpenAI API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("OpenAI returned no embedding")]
    EmptyResponse,
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    temperature: f32,
    stream: bool,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-3.5-turbo".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }

    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, OpenAiError> {
        let request = EmbeddingRequest {
            input: texts,
            model: self.embedding_model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OpenAiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let embedding_response: EmbeddingResponse = response.json().await?;
        Ok(embedding_response
            .data
            .into_iter()
            .map(|d| d.embedding)
            .collect())
    }

    pub async fn embed_one(&self, text: String) -> Result<Vec<f32>, OpenAiError> {
        let embeddings = self.embed(vec![text]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or(OpenAiError::EmptyResponse)
    }

    /// Opens a streamed chat completion at deterministic sampling. The
    /// caller drives the response's byte stream through an
    /// [`SseDeltaParser`] to recover content deltas.
    pub async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<reqwest::Response, OpenAiError> {
        let request = ChatCompletionRequest {
            model: self.chat_model.clone(),
            temperature: 0.0,
            stream: true,
            messages,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OpenAiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

/// Incremental parser for the `data: {json}` event lines of a streamed
/// completion body. Chunk boundaries fall anywhere, including inside a
/// line; bytes are buffered until a full line arrives. `\n` is never part
/// of a multi-byte UTF-8 sequence, so splitting on it is safe.
#[derive(Debug, Default)]
pub struct SseDeltaParser {
    buf: Vec<u8>,
    done: bool,
}

impl SseDeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk, returning the content deltas completed by
    /// it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            let payload = match line.strip_prefix("data:") {
                Some(rest) => rest.trim_start(),
                None => continue, // event/comment lines and blank separators
            };

            if payload == "[DONE]" {
                self.done = true;
                continue;
            }

            match serde_json::from_str::<ChatCompletionChunk>(payload) {
                Ok(chunk) => {
                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                deltas.push(content);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping unparseable completion chunk: {}", e);
                }
            }
        }

        deltas
    }

    /// Whether the upstream sent its `[DONE]` terminator. A stream that
    /// ends without one is treated as complete-as-received.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
            serde_json::to_string(content).unwrap()
        )
    }

    #[test]
    fn extracts_deltas_from_whole_events() {
        let mut parser = SseDeltaParser::new();
        let deltas = parser.push(format!("{}{}", event("Hel"), event("lo")).as_bytes());
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert!(!parser.is_done());
    }

    #[test]
    fn reassembles_events_split_at_arbitrary_byte_boundaries() {
        let stream = format!("{}{}data: [DONE]\n\n", event("Hel"), event("lo"));
        let bytes = stream.as_bytes();

        // Any split point must produce the same deltas.
        for split in 1..bytes.len() {
            let mut parser = SseDeltaParser::new();
            let mut deltas = parser.push(&bytes[..split]);
            deltas.extend(parser.push(&bytes[split..]));
            assert_eq!(deltas, vec!["Hel", "lo"], "split at {}", split);
            assert!(parser.is_done(), "split at {}", split);
        }
    }

    #[test]
    fn multibyte_content_survives_mid_character_splits() {
        let stream = event("héllo ☃");
        let bytes = stream.as_bytes();
        for split in 1..bytes.len() {
            let mut parser = SseDeltaParser::new();
            let mut deltas = parser.push(&bytes[..split]);
            deltas.extend(parser.push(&bytes[split..]));
            assert_eq!(deltas.concat(), "héllo ☃", "split at {}", split);
        }
    }

    #[test]
    fn ignores_comments_keepalives_and_null_deltas() {
        let mut parser = SseDeltaParser::new();
        let input = ": keepalive\n\ndata: {\"choices\":[{\"delta\":{}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n";
        assert_eq!(parser.push(input.as_bytes()), vec!["x"]);
    }

    #[test]
    fn done_marker_sets_flag_and_yields_nothing() {
        let mut parser = SseDeltaParser::new();
        assert!(parser.push(b"data: [DONE]\n\n").is_empty());
        assert!(parser.is_done());
    }
}
