use crate::handlers::auth::verify_session_token;
use crate::models::auth::ErrorResponse;
use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};

/// Requires a valid session token on every route of the router it wraps.
/// The verified claims land in the request extensions for handlers.
pub async fn auth_middleware(
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let auth_header = match headers.get("Authorization") {
        Some(header) => header,
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Missing Authorization header")),
            ));
        }
    };

    let auth_str = match auth_header.to_str() {
        Ok(s) => s,
        Err(_) => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Invalid Authorization header format")),
            ));
        }
    };

    let token = match auth_str.strip_prefix("Bearer ") {
        Some(token) => token,
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(
                    "Invalid Authorization header format. Expected 'Bearer <token>'",
                )),
            ));
        }
    };

    let claims = match verify_session_token(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!("Session token verification failed: {}", e);
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Invalid or expired session")),
            ));
        }
    };

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
