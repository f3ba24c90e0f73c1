// src/pipeline.rs
//! The retrieval-augmented answer pipeline: question in, streamed answer
//! out, both turns persisted. The question is durably appended before any
//! vendor call, so a crash mid-generation leaves a recoverable state
//! (question visible, answer absent) rather than a corrupted one.

use crate::models::message::Message;
use crate::models::user::User;
use crate::openai_client::{ChatMessage, SseDeltaParser};
use crate::plans::resolve_subscription;
use crate::store::files::FileStoreError;
use crate::store::messages::MessageStoreError;
use crate::vector_store::RetrievedPassage;
use crate::AppState;
use axum::body::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;

/// How many prior turns ride along as conversation context.
const HISTORY_WINDOW: usize = 6;

const SYSTEM_PROMPT: &str = "Use the following pieces of context (or previous conversation if needed) to answer the user's question in markdown format.";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("file not found or not owned by caller")]
    NotFound,
    #[error("{0} client is not configured")]
    MissingClient(&'static str),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("store failure: {0}")]
    Store(#[from] MessageStoreError),
}

impl From<FileStoreError> for PipelineError {
    fn from(e: FileStoreError) -> Self {
        match e {
            FileStoreError::NotFound => PipelineError::NotFound,
            FileStoreError::Database(db) => PipelineError::Store(MessageStoreError::Database(db)),
        }
    }
}

/// Runs the pipeline for one question and returns the chunk stream.
///
/// Any failure before the first byte aborts with an error; a failure
/// mid-stream simply truncates the stream, and the client treats what it
/// received as complete. When the upstream finishes, the concatenated
/// answer is appended to the store; if that write fails the failure is
/// logged, never surfaced — the streamed answer is not retracted.
pub async fn answer_question(
    state: Arc<AppState>,
    file_id: &str,
    user_id: &str,
    question: &str,
) -> Result<
    impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    PipelineError,
> {
    // Authorize before any work.
    let file = state.file_store.find_owned(file_id, user_id).await?;

    // The question survives even if everything after this fails.
    let question_row = state
        .message_store
        .append(&file.id, user_id, question, true)
        .await?;

    let openai = state
        .openai_client
        .as_ref()
        .ok_or(PipelineError::MissingClient("OpenAI"))?;
    let vectors = state
        .vector_store
        .as_ref()
        .ok_or(PipelineError::MissingClient("vector store"))?;

    let top_k = retrieval_limit(&state, user_id).await;

    let query_embedding = openai
        .embed_one(question.to_string())
        .await
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;

    let passages = vectors
        .search(&file.id, query_embedding, top_k)
        .await
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;

    // One extra row so the just-appended question can be dropped from the
    // window without shrinking it.
    let history = state
        .message_store
        .recent(&file.id, (HISTORY_WINDOW + 1) as i64)
        .await?;
    let history = context_window(history, &question_row.id, HISTORY_WINDOW);

    let prompt = build_prompt(&history, &passages, question);

    let response = openai
        .chat_stream(prompt)
        .await
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;

    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, std::io::Error>>();

    let message_store = state.message_store.clone();
    let file_id = file.id.clone();
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        let mut parser = SseDeltaParser::new();
        let mut answer = String::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for delta in parser.push(&bytes) {
                        answer.push_str(&delta);
                        // A closed receiver means the client went away;
                        // keep draining so the full answer still persists.
                        let _ = tx.unbounded_send(Ok(Bytes::from(delta.into_bytes())));
                    }
                }
                Err(e) => {
                    tracing::warn!("Completion stream aborted mid-answer: {}", e);
                    break;
                }
            }
        }
        drop(tx);

        if answer.is_empty() {
            tracing::warn!("Completion produced no content for file {}", file_id);
            return;
        }

        if let Err(e) = message_store.append(&file_id, &user_id, &answer, false).await {
            tracing::error!(
                "Failed to persist assistant answer for file {}: {}",
                file_id,
                e
            );
        }
    });

    Ok(rx)
}

/// Plan-dependent top-K; falls back to the free tier when the user row is
/// not readable (it always exists after the auth callback).
async fn retrieval_limit(state: &AppState, user_id: &str) -> u64 {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, stripe_customer_id, stripe_subscription_id, stripe_price_id,
                stripe_current_period_end, created_at
         FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db_pool)
    .await;

    match user {
        Ok(Some(user)) => resolve_subscription(&user).plan.results_per_query,
        _ => crate::plans::Plan::free().results_per_query,
    }
}

/// Drops the just-appended question from the history and caps the window
/// at `limit` turns, keeping the most recent ones (input is oldest first).
fn context_window(history: Vec<Message>, exclude_id: &str, limit: usize) -> Vec<Message> {
    let mut window: Vec<Message> = history.into_iter().filter(|m| m.id != exclude_id).collect();
    if window.len() > limit {
        window.drain(..window.len() - limit);
    }
    window
}

/// One prompt: fixed system instruction, the prior turns, the retrieved
/// passages, and the literal question.
fn build_prompt(
    history: &[Message],
    passages: &[RetrievedPassage],
    question: &str,
) -> Vec<ChatMessage> {
    let mut transcript = String::new();
    for turn in history {
        if turn.is_user_message {
            transcript.push_str(&format!("User: {}\n", turn.text));
        } else {
            transcript.push_str(&format!("Assistant: {}\n", turn.text));
        }
    }

    let context = passages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let user_prompt = format!(
        "Use the following pieces of context (or previous conversation if needed) to answer the user's question in markdown format.\nIf you don't know the answer, just say that you don't know, don't try to make up an answer.\n\n----------------\n\nPREVIOUS CONVERSATION:\n{}\n\n----------------\n\nCONTEXT:\n{}\n\nUSER INPUT: {}",
        transcript, context, question
    );

    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user_prompt),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, text: &str, is_user: bool, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            file_id: "f1".to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            is_user_message: is_user,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn passage(text: &str) -> RetrievedPassage {
        RetrievedPassage {
            page: 1,
            text: text.to_string(),
            score: 0.9,
        }
    }

    #[test]
    fn window_drops_the_current_question_and_keeps_newest_turns() {
        let history = vec![
            message("a", "first", true, 10),
            message("b", "second", false, 20),
            message("c", "third", true, 30),
            message("q", "the question", true, 40),
        ];

        let window = context_window(history, "q", 2);
        let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn prompt_carries_transcript_passages_and_question() {
        let history = vec![
            message("a", "what is this?", true, 10),
            message("b", "a quarterly report", false, 20),
        ];
        let passages = vec![passage("Revenue grew 12%."), passage("Costs were flat.")];

        let prompt = build_prompt(&history, &passages, "What is the total?");

        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, "system");
        assert_eq!(prompt[1].role, "user");

        let body = &prompt[1].content;
        assert!(body.contains("User: what is this?"));
        assert!(body.contains("Assistant: a quarterly report"));
        assert!(body.contains("Revenue grew 12%.\n\nCosts were flat."));
        assert!(body.contains("USER INPUT: What is the total?"));
    }

    #[test]
    fn prompt_with_no_history_or_passages_still_carries_the_question() {
        let prompt = build_prompt(&[], &[], "Anything?");
        assert!(prompt[1].content.contains("USER INPUT: Anything?"));
    }
}
