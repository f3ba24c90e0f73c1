use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Immutable chat turn. The append-only log for a file is totally ordered
/// by (created_at, id) descending; the id tie-break keeps cursors stable
/// when two rows share a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub file_id: String,
    pub user_id: String,
    pub text: String,
    pub is_user_message: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub id: String,
    pub text: String,
    pub is_user_message: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Message> for MessageResponse {
    fn from(msg: Message) -> Self {
        MessageResponse {
            id: msg.id,
            text: msg.text,
            is_user_message: msg.is_user_message,
            created_at: msg.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePageResponse {
    pub messages: Vec<MessageResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub file_id: String,
    pub message: String,
}
