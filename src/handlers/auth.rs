// src/handlers/auth.rs
use crate::middleware::auth::auth_middleware;
use crate::models::auth::{Claims, ErrorResponse};
use crate::AppState;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::json;
use std::sync::Arc;

pub fn auth_routes() -> Router {
    Router::new()
        .route("/api/auth/callback", post(auth_callback))
        .layer(axum::middleware::from_fn(auth_middleware))
}

/// Decodes a session token issued by the identity provider. The shared
/// secret comes from the environment; tokens are not issued here.
pub fn verify_session_token(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let secret = std::env::var("SESSION_JWT_SECRET").unwrap_or_else(|_| "default_secret".to_string());

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

/// Idempotent: ensures a local user record exists for the authenticated
/// identity, creating one on first sight. Called by the client right
/// after sign-in.
async fn auth_callback(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let result = sqlx::query(
        "INSERT INTO users (id, email) VALUES ($1, $2)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(&claims.sub)
    .bind(&claims.email)
    .execute(&state.db_pool)
    .await;

    match result {
        Ok(outcome) => {
            if outcome.rows_affected() > 0 {
                tracing::info!("Created local user record for {}", claims.sub);
            }
            Ok(Json(json!({ "success": true })))
        }
        Err(e) => {
            tracing::error!("Failed to upsert user {}: {}", claims.sub, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Internal server error")),
            ))
        }
    }
}
