// src/handlers/upload.rs
use crate::models::auth::ErrorResponse;
use crate::models::file::{File, UploadStatus};
use crate::plans::Plan;
use crate::vector_store::PagePassage;
use crate::AppState;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn upload_routes() -> Router {
    // Invoked by the storage collaborator, not by browsers.
    Router::new().route("/api/uploadthing", post(upload_complete))
}

#[derive(Debug, Deserialize)]
pub struct UploadCompletePayload {
    pub metadata: UploadMetadata,
    pub file: UploadedObject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub user_id: String,
    pub subscription_plan: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadedObject {
    pub key: String,
    pub name: String,
    pub url: String,
}

enum ProcessOutcome {
    Indexed,
    QuotaExceeded { pages: usize, ceiling: usize },
}

/// Upload-completion webhook. Exactly-once per object: a repeat trigger
/// for a key we already row-ed is acknowledged and skipped. The file row
/// is created PROCESSING, then fetch → extract → quota → index decides
/// SUCCESS or FAILED; failure is terminal and surfaced only through the
/// status field the client polls.
async fn upload_complete(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<UploadCompletePayload>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.file_store.find_by_key(&payload.file.key).await {
        Ok(Some(existing)) => {
            tracing::debug!(
                "Duplicate upload trigger for key {}, skipping",
                payload.file.key
            );
            return Ok(Json(json!({ "success": true, "fileId": existing.id })));
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Failed to check for existing file: {}", e);
            return Err(internal_error());
        }
    }

    let file = match state
        .file_store
        .create_processing(
            &payload.metadata.user_id,
            &payload.file.key,
            &payload.file.name,
            &payload.file.url,
        )
        .await
    {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("Failed to create file row for {}: {}", payload.file.key, e);
            return Err(internal_error());
        }
    };

    let plan = Plan::for_slug(&payload.metadata.subscription_plan);

    let final_status = match process_upload(&state, &file, &plan).await {
        Ok(ProcessOutcome::Indexed) => UploadStatus::Success,
        Ok(ProcessOutcome::QuotaExceeded { pages, ceiling }) => {
            tracing::info!(
                "File {} has {} pages, over the {} ceiling of {} — rejecting",
                file.id,
                pages,
                plan.name,
                ceiling
            );
            UploadStatus::Failed
        }
        Err(e) => {
            tracing::error!("Upload processing failed for file {}: {}", file.id, e);
            UploadStatus::Failed
        }
    };

    if let Err(e) = state.file_store.set_status(&file.id, final_status).await {
        tracing::error!("Failed to record status for file {}: {}", file.id, e);
        return Err(internal_error());
    }

    Ok(Json(json!({ "success": true, "fileId": file.id })))
}

async fn process_upload(
    state: &AppState,
    file: &File,
    plan: &Plan,
) -> Result<ProcessOutcome, Box<dyn std::error::Error + Send + Sync>> {
    let response = state.http_client.get(&file.url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("object fetch returned {}", status).into());
    }
    let bytes = response.bytes().await?;

    let pages = crate::pdf::extract_pages(&bytes)?;
    tracing::info!("Extracted {} page(s) from file {}", pages.len(), file.id);

    if pages.len() > plan.pages_per_pdf {
        return Ok(ProcessOutcome::QuotaExceeded {
            pages: pages.len(),
            ceiling: plan.pages_per_pdf,
        });
    }

    let openai = state
        .openai_client
        .as_ref()
        .ok_or("OpenAI client is not configured")?;
    let vectors = state
        .vector_store
        .as_ref()
        .ok_or("vector store is not configured")?;

    // Blank pages count against the quota but are not worth indexing.
    let indexable: Vec<PagePassage> = pages
        .into_iter()
        .filter(|p| !p.text.trim().is_empty())
        .collect();

    if !indexable.is_empty() {
        let texts: Vec<String> = indexable.iter().map(|p| p.text.clone()).collect();
        let embeddings = openai.embed(texts).await?;

        if embeddings.len() != indexable.len() {
            return Err("embedding count does not match page count".into());
        }

        vectors
            .index_pages(&file.id, indexable.into_iter().zip(embeddings).collect())
            .await?;
    }

    Ok(ProcessOutcome::Indexed)
}

fn internal_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Internal server error")),
    )
}
