// src/handlers/files.rs
use crate::middleware::auth::auth_middleware;
use crate::models::auth::{Claims, ErrorResponse};
use crate::models::file::FileResponse;
use crate::models::message::{MessagePageResponse, MessageResponse};
use crate::store::files::FileStoreError;
use crate::store::messages::MessageStoreError;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Default page size for the chat history infinite query.
const DEFAULT_QUERY_LIMIT: i64 = 10;
const MAX_QUERY_LIMIT: i64 = 100;

pub fn file_routes() -> Router {
    Router::new()
        .route("/api/files", get(get_user_files))
        .route("/api/files/by-key", post(get_file_by_key))
        .route("/api/files/:file_id", delete(delete_file))
        .route("/api/files/:file_id/messages", get(get_file_messages))
        .route("/api/files/:file_id/status", get(get_file_upload_status))
        .layer(axum::middleware::from_fn(auth_middleware))
}

async fn get_user_files(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<FileResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let files = state
        .file_store
        .list_for_user(&claims.sub)
        .await
        .map_err(file_store_error)?;

    Ok(Json(files.into_iter().map(FileResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<i64>,
    cursor: Option<String>,
}

async fn get_file_messages(
    Path(file_id): Path<String>,
    Query(params): Query<MessagesQuery>,
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MessagePageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT);

    let page = state
        .message_store
        .page(&file_id, &claims.sub, limit, params.cursor.as_deref())
        .await
        .map_err(message_store_error)?;

    Ok(Json(MessagePageResponse {
        messages: page
            .messages
            .into_iter()
            .map(MessageResponse::from)
            .collect(),
        next_cursor: page.next_cursor,
    }))
}

async fn get_file_upload_status(
    Path(file_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let status = state
        .message_store
        .get_status(&file_id, &claims.sub)
        .await
        .map_err(message_store_error)?;

    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
struct FileByKeyRequest {
    key: String,
}

/// Lookup by storage key, polled by the client between upload completion
/// and file-row creation. 404 until the row exists.
async fn get_file_by_key(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<FileByKeyRequest>,
) -> Result<Json<FileResponse>, (StatusCode, Json<ErrorResponse>)> {
    let file = state
        .file_store
        .find_owned_by_key(&payload.key, &claims.sub)
        .await
        .map_err(file_store_error)?;

    Ok(Json(FileResponse::from(file)))
}

async fn delete_file(
    Path(file_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<FileResponse>, (StatusCode, Json<ErrorResponse>)> {
    let file = state
        .file_store
        .delete(&file_id, &claims.sub)
        .await
        .map_err(file_store_error)?;

    // Vector cleanup is best-effort: orphaned points are unreachable once
    // the file row is gone, and reindexing a new upload gets a fresh id.
    if let Some(ref vectors) = state.vector_store {
        if let Err(e) = vectors.delete_namespace(&file.id).await {
            tracing::warn!("Failed to delete vector namespace for {}: {}", file.id, e);
        }
    }

    Ok(Json(FileResponse::from(file)))
}

fn file_store_error(e: FileStoreError) -> (StatusCode, Json<ErrorResponse>) {
    match e {
        FileStoreError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("File not found")),
        ),
        FileStoreError::Database(db) => {
            tracing::error!("Database error: {}", db);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Internal server error")),
            )
        }
    }
}

fn message_store_error(e: MessageStoreError) -> (StatusCode, Json<ErrorResponse>) {
    match e {
        MessageStoreError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("File not found")),
        ),
        MessageStoreError::InvalidCursor => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Invalid pagination cursor")),
        ),
        MessageStoreError::Database(db) => {
            tracing::error!("Database error: {}", db);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Internal server error")),
            )
        }
    }
}
