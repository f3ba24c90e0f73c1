use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One-directional: PENDING -> PROCESSING -> {SUCCESS | FAILED}, terminal
/// once SUCCESS or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "upload_status")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct File {
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub name: String,
    pub url: String,
    pub upload_status: UploadStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub id: String,
    pub key: String,
    pub name: String,
    pub url: String,
    pub upload_status: UploadStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<File> for FileResponse {
    fn from(file: File) -> Self {
        FileResponse {
            id: file.id,
            key: file.key,
            name: file.name,
            url: file.url,
            upload_status: file.upload_status,
            created_at: file.created_at,
        }
    }
}
