// src/handlers/billing.rs
use crate::middleware::auth::auth_middleware;
use crate::models::auth::{Claims, ErrorResponse};
use crate::models::user::User;
use crate::plans::resolve_subscription;
use crate::stripe_client::{classify_event, verify_webhook_signature, StripeEvent, WebhookAction};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use chrono::TimeZone;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn billing_routes() -> Router {
    let public_routes = Router::new().route("/api/webhooks/stripe", post(stripe_webhook));

    let protected_routes = Router::new()
        .route("/api/billing/session", post(create_stripe_session))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes.merge(protected_routes)
}

/// Returns a redirect URL: the billing-management portal when the caller
/// already has an active subscription and a Stripe customer, otherwise a
/// subscription checkout session.
async fn create_stripe_session(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let stripe = state.stripe_client.as_ref().ok_or_else(|| {
        tracing::error!("Stripe client is not configured");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("Billing is not available")),
        )
    })?;

    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, stripe_customer_id, stripe_subscription_id, stripe_price_id,
                stripe_current_period_end, created_at
         FROM users WHERE id = $1",
    )
    .bind(&claims.sub)
    .fetch_optional(&state.db_pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to load user {}: {}", claims.sub, e);
        internal_error()
    })?
    .ok_or((
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("Unknown user")),
    ))?;

    let billing_url = format!("{}/dashboard/billing", state.app_url);
    let subscription = resolve_subscription(&user);

    let url = if subscription.is_subscribed {
        if let Some(customer_id) = subscription.stripe_customer_id {
            stripe
                .create_billing_portal_session(&customer_id, &billing_url)
                .await
        } else {
            // Subscribed but no recorded customer — the checkout webhook
            // has not landed yet; send them through checkout again.
            checkout(&state, stripe, &user.id, &billing_url).await
        }
    } else {
        checkout(&state, stripe, &user.id, &billing_url).await
    }
    .map_err(|e| {
        tracing::error!("Stripe session creation failed: {}", e);
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse::new("Payment provider error")),
        )
    })?;

    Ok(Json(json!({ "url": url })))
}

async fn checkout(
    state: &AppState,
    stripe: &crate::stripe_client::StripeClient,
    user_id: &str,
    billing_url: &str,
) -> Result<String, crate::stripe_client::StripeError> {
    let price_id = state.stripe_pro_price_id.clone().unwrap_or_default();
    stripe
        .create_checkout_session(user_id, &price_id, billing_url)
        .await
}

/// Billing webhook. The signature is verified against the raw body before
/// anything else; events that are not relevant are acknowledged so the
/// provider does not redeliver them forever.
async fn stripe_webhook(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(secret) = state.stripe_webhook_secret.as_deref() else {
        tracing::error!("Stripe webhook secret is not configured");
        return StatusCode::BAD_REQUEST;
    };

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Err(e) =
        verify_webhook_signature(&body, signature, secret, chrono::Utc::now().timestamp())
    {
        tracing::warn!("Rejected Stripe webhook: {}", e);
        return StatusCode::BAD_REQUEST;
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Unparseable Stripe webhook payload: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    match classify_event(&event) {
        WebhookAction::Ignore => StatusCode::OK,
        WebhookAction::CheckoutCompleted {
            user_id,
            subscription_id,
        } => apply_checkout_completed(&state, &user_id, &subscription_id).await,
        WebhookAction::InvoicePaid { subscription_id } => {
            apply_invoice_paid(&state, &subscription_id).await
        }
    }
}

async fn apply_checkout_completed(
    state: &AppState,
    user_id: &str,
    subscription_id: &str,
) -> StatusCode {
    let Some(stripe) = state.stripe_client.as_ref() else {
        tracing::error!("Stripe client is not configured");
        return StatusCode::INTERNAL_SERVER_ERROR;
    };

    let subscription = match stripe.retrieve_subscription(subscription_id).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!("Failed to retrieve subscription {}: {}", subscription_id, e);
            return StatusCode::BAD_GATEWAY;
        }
    };

    let period_end = chrono::Utc
        .timestamp_opt(subscription.current_period_end, 0)
        .single();

    let result = sqlx::query(
        "UPDATE users
         SET stripe_subscription_id = $1,
             stripe_customer_id = $2,
             stripe_price_id = $3,
             stripe_current_period_end = $4
         WHERE id = $5",
    )
    .bind(&subscription.id)
    .bind(&subscription.customer)
    .bind(subscription.price_id())
    .bind(period_end)
    .bind(user_id)
    .execute(&state.db_pool)
    .await;

    match result {
        Ok(_) => {
            tracing::info!("Recorded new subscription {} for user {}", subscription.id, user_id);
            StatusCode::OK
        }
        Err(e) => {
            tracing::error!("Failed to record subscription for {}: {}", user_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn apply_invoice_paid(state: &AppState, subscription_id: &str) -> StatusCode {
    let Some(stripe) = state.stripe_client.as_ref() else {
        tracing::error!("Stripe client is not configured");
        return StatusCode::INTERNAL_SERVER_ERROR;
    };

    let subscription = match stripe.retrieve_subscription(subscription_id).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!("Failed to retrieve subscription {}: {}", subscription_id, e);
            return StatusCode::BAD_GATEWAY;
        }
    };

    let period_end = chrono::Utc
        .timestamp_opt(subscription.current_period_end, 0)
        .single();

    let result = sqlx::query(
        "UPDATE users
         SET stripe_price_id = $1,
             stripe_current_period_end = $2
         WHERE stripe_subscription_id = $3",
    )
    .bind(subscription.price_id())
    .bind(period_end)
    .bind(&subscription.id)
    .execute(&state.db_pool)
    .await;

    match result {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::error!(
                "Failed to refresh subscription {}: {}",
                subscription.id,
                e
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn internal_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Internal server error")),
    )
}
