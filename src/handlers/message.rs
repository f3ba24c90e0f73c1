// src/handlers/message.rs
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::message::SendMessageRequest;
use crate::pipeline::{self, PipelineError};
use crate::AppState;
use axum::{
    body::Body,
    extract::Extension,
    http::{header, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use std::sync::Arc;

pub fn message_routes() -> Router {
    Router::new()
        .route("/api/message", post(send_message))
        .layer(axum::middleware::from_fn(auth_middleware))
}

/// Asks a question about a file and streams the growing answer back as a
/// chunked text body. Authorization and lookup failures return bare
/// status codes with no body; a mid-stream upstream failure truncates
/// the stream, which the client treats as complete-as-received.
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    axum::Json(payload): axum::Json<SendMessageRequest>,
) -> Result<Response, StatusCode> {
    if payload.message.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let stream =
        pipeline::answer_question(state, &payload.file_id, &claims.sub, &payload.message)
            .await
            .map_err(|e| match e {
                PipelineError::NotFound => StatusCode::NOT_FOUND,
                PipelineError::MissingClient(name) => {
                    tracing::error!("{} client is not configured", name);
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PipelineError::Upstream(msg) => {
                    tracing::error!("Answer pipeline upstream failure: {}", msg);
                    StatusCode::BAD_GATEWAY
                }
                PipelineError::Store(err) => {
                    tracing::error!("Answer pipeline store failure: {}", err);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
