// src/store/files.rs
use crate::models::file::{File, UploadStatus};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("file not found or not owned by caller")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct FileStore {
    pool: PgPool,
}

impl FileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a file row in PROCESSING, the state the upload pipeline
    /// works in until it settles on SUCCESS or FAILED.
    pub async fn create_processing(
        &self,
        user_id: &str,
        key: &str,
        name: &str,
        url: &str,
    ) -> Result<File, FileStoreError> {
        let file = sqlx::query_as::<_, File>(
            "INSERT INTO files (id, user_id, key, name, url, upload_status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, user_id, key, name, url, upload_status, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(key)
        .bind(name)
        .bind(url)
        .bind(UploadStatus::Processing)
        .fetch_one(&self.pool)
        .await?;

        Ok(file)
    }

    /// Lookup by storage key alone — keys are globally unique, and the
    /// upload webhook uses this to skip duplicate trigger invocations.
    pub async fn find_by_key(&self, key: &str) -> Result<Option<File>, FileStoreError> {
        let file = sqlx::query_as::<_, File>(
            "SELECT id, user_id, key, name, url, upload_status, created_at
             FROM files WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file)
    }

    /// Ownership-checked key lookup, used by post-upload polling.
    pub async fn find_owned_by_key(
        &self,
        key: &str,
        user_id: &str,
    ) -> Result<File, FileStoreError> {
        let file = sqlx::query_as::<_, File>(
            "SELECT id, user_id, key, name, url, upload_status, created_at
             FROM files WHERE key = $1 AND user_id = $2",
        )
        .bind(key)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        file.ok_or(FileStoreError::NotFound)
    }

    pub async fn find_owned(&self, file_id: &str, user_id: &str) -> Result<File, FileStoreError> {
        let file = sqlx::query_as::<_, File>(
            "SELECT id, user_id, key, name, url, upload_status, created_at
             FROM files WHERE id = $1 AND user_id = $2",
        )
        .bind(file_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        file.ok_or(FileStoreError::NotFound)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<File>, FileStoreError> {
        let files = sqlx::query_as::<_, File>(
            "SELECT id, user_id, key, name, url, upload_status, created_at
             FROM files WHERE user_id = $1
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(files)
    }

    /// Last write wins; a single pipeline run owns a file's transitions.
    pub async fn set_status(&self, file_id: &str, status: UploadStatus) -> Result<(), FileStoreError> {
        sqlx::query("UPDATE files SET upload_status = $1 WHERE id = $2")
            .bind(status)
            .bind(file_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes an owned file; messages go with it via the FK cascade.
    /// Returns the deleted row so callers can clean up the vector
    /// namespace afterwards.
    pub async fn delete(&self, file_id: &str, user_id: &str) -> Result<File, FileStoreError> {
        let file = self.find_owned(file_id, user_id).await?;

        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(&file.id)
            .execute(&self.pool)
            .await?;

        Ok(file)
    }
}
