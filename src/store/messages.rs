// src/store/messages.rs
use crate::models::file::UploadStatus;
use crate::models::message::Message;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MessageStoreError {
    #[error("file not found or not owned by caller")]
    NotFound,
    #[error("cursor does not reference a message of this file")]
    InvalidCursor,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One page of a file's conversation, newest first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// Durable, append-only record of per-file conversation history.
///
/// Every read goes through an ownership check on the referenced file, so
/// callers can never see messages of a file they do not own.
#[derive(Clone)]
pub struct MessageStore {
    pool: PgPool,
}

impl MessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Appends an immutable message. Fails with `NotFound` when the file
    /// does not exist or belongs to another user.
    pub async fn append(
        &self,
        file_id: &str,
        user_id: &str,
        text: &str,
        is_user_message: bool,
    ) -> Result<Message, MessageStoreError> {
        self.assert_owned(file_id, user_id).await?;

        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (id, file_id, user_id, text, is_user_message)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, file_id, user_id, text, is_user_message, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(file_id)
        .bind(user_id)
        .bind(text)
        .bind(is_user_message)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    /// Returns at most `limit` messages newest-first. Fetches `limit + 1`
    /// rows to decide whether a further page exists; the trimmed-off row's
    /// id becomes the next cursor. The cursor row is the first row of the
    /// page it names, so iterating until `next_cursor` disappears yields
    /// every message exactly once.
    pub async fn page(
        &self,
        file_id: &str,
        user_id: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<MessagePage, MessageStoreError> {
        self.assert_owned(file_id, user_id).await?;

        let rows = match cursor {
            Some(cursor_id) => {
                let anchor = sqlx::query_as::<_, (chrono::DateTime<chrono::Utc>, String)>(
                    "SELECT created_at, id FROM messages WHERE id = $1 AND file_id = $2",
                )
                .bind(cursor_id)
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(MessageStoreError::InvalidCursor)?;

                sqlx::query_as::<_, Message>(
                    "SELECT id, file_id, user_id, text, is_user_message, created_at
                     FROM messages
                     WHERE file_id = $1
                       AND (created_at < $2 OR (created_at = $2 AND id <= $3))
                     ORDER BY created_at DESC, id DESC
                     LIMIT $4",
                )
                .bind(file_id)
                .bind(anchor.0)
                .bind(&anchor.1)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Message>(
                    "SELECT id, file_id, user_id, text, is_user_message, created_at
                     FROM messages
                     WHERE file_id = $1
                     ORDER BY created_at DESC, id DESC
                     LIMIT $2",
                )
                .bind(file_id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(trim_to_page(rows, limit))
    }

    /// The `limit` most recent messages, oldest first, for prompt context.
    pub async fn recent(&self, file_id: &str, limit: i64) -> Result<Vec<Message>, MessageStoreError> {
        let mut messages = sqlx::query_as::<_, Message>(
            "SELECT id, file_id, user_id, text, is_user_message, created_at
             FROM messages
             WHERE file_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2",
        )
        .bind(file_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        messages.reverse();
        Ok(messages)
    }

    /// Upload status of a file, or PENDING when the row is not visible
    /// yet. The default absorbs the race between upload start and file-row
    /// creation, which the client polls across.
    pub async fn get_status(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<UploadStatus, MessageStoreError> {
        let status = sqlx::query_scalar::<_, UploadStatus>(
            "SELECT upload_status FROM files WHERE id = $1 AND user_id = $2",
        )
        .bind(file_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status.unwrap_or(UploadStatus::Pending))
    }

    async fn assert_owned(&self, file_id: &str, user_id: &str) -> Result<(), MessageStoreError> {
        let owned = sqlx::query_scalar::<_, String>(
            "SELECT id FROM files WHERE id = $1 AND user_id = $2",
        )
        .bind(file_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match owned {
            Some(_) => Ok(()),
            None => Err(MessageStoreError::NotFound),
        }
    }
}

/// Trims a `limit + 1` fetch back down to `limit` rows. The extra row, if
/// present, proves a further page exists and supplies its cursor.
fn trim_to_page(mut rows: Vec<Message>, limit: i64) -> MessagePage {
    let next_cursor = if rows.len() as i64 > limit {
        rows.pop().map(|overflow| overflow.id)
    } else {
        None
    };

    MessagePage {
        messages: rows,
        next_cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            file_id: "f1".to_string(),
            user_id: "u1".to_string(),
            text: format!("message {}", id),
            is_user_message: true,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn trim_keeps_full_page_and_exposes_cursor() {
        let rows = vec![message("c", 30), message("b", 20), message("a", 10)];
        let page = trim_to_page(rows, 2);

        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].id, "c");
        assert_eq!(page.messages[1].id, "b");
        assert_eq!(page.next_cursor.as_deref(), Some("a"));
    }

    #[test]
    fn trim_omits_cursor_when_exhausted() {
        let rows = vec![message("b", 20), message("a", 10)];
        let page = trim_to_page(rows, 2);

        assert_eq!(page.messages.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn trim_handles_short_and_empty_pages() {
        let page = trim_to_page(vec![message("a", 10)], 5);
        assert_eq!(page.messages.len(), 1);
        assert!(page.next_cursor.is_none());

        let empty = trim_to_page(Vec::new(), 5);
        assert!(empty.messages.is_empty());
        assert!(empty.next_cursor.is_none());
    }

    #[test]
    fn paging_a_fixed_log_yields_each_row_exactly_once() {
        // Two rows share a timestamp; the id tie-break keeps the walk stable.
        let log = vec![
            message("e", 40),
            message("d", 30),
            message("c", 20),
            message("b", 20),
            message("a", 10),
        ];

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let remaining: Vec<Message> = match &cursor {
                None => log.clone(),
                Some(c) => {
                    // The cursor row opens the page it names.
                    let pos = log.iter().position(|m| &m.id == c).unwrap();
                    log[pos..].to_vec()
                }
            };
            let page = trim_to_page(remaining.into_iter().take(3).collect(), 2);
            seen.extend(page.messages.iter().map(|m| m.id.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen, vec!["e", "d", "c", "b", "a"]);
    }
}
