use axum::{Extension, Router};
use doku::{db, handlers, middleware, openai_client, stripe_client, vector_store, AppState};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize production-grade logging
    init_logging().expect("Failed to initialize logging");

    // Create the database connection pool
    let db_pool = db::create_pool()
        .await
        .expect("Failed to create database pool.");

    // Initialize OpenAI client if API key is provided
    let openai = match std::env::var("OPENAI_API_KEY").ok() {
        Some(api_key) if !api_key.is_empty() => {
            tracing::info!("Initializing OpenAI client (embeddings + chat completions)...");
            Some(openai_client::OpenAiClient::new(api_key))
        }
        _ => {
            tracing::warn!("OPENAI_API_KEY not found. Document chat will be disabled.");
            None
        }
    };

    // Initialize Qdrant client if a URL is provided
    let vectors = match std::env::var("QDRANT_URL").ok() {
        Some(url) if !url.is_empty() => {
            tracing::info!("Initializing Qdrant vector database...");
            let api_key = std::env::var("QDRANT_API_KEY").ok();

            match vector_store::VectorStore::new(url, api_key) {
                Ok(store) => match store.create_collection().await {
                    Ok(_) => {
                        tracing::info!("Qdrant initialized successfully");
                        Some(store)
                    }
                    Err(e) => {
                        tracing::error!("Failed to initialize Qdrant collection: {}", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to connect to Qdrant: {}", e);
                    None
                }
            }
        }
        _ => {
            tracing::warn!("QDRANT_URL not found. Document indexing and retrieval disabled.");
            None
        }
    };

    // Initialize Stripe client if the secret key is provided
    let stripe = match std::env::var("STRIPE_SECRET_KEY").ok() {
        Some(secret) if !secret.is_empty() => {
            tracing::info!("Initializing Stripe billing client...");
            Some(stripe_client::StripeClient::new(secret))
        }
        _ => {
            tracing::warn!("STRIPE_SECRET_KEY not found. Billing will be disabled.");
            None
        }
    };

    let stripe_webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").ok();
    if stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not found. Billing webhooks will be rejected.");
    }
    let stripe_pro_price_id = std::env::var("STRIPE_PRO_PRICE_ID").ok();

    let app_url =
        std::env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    // Create the shared state
    let shared_state = Arc::new(AppState {
        message_store: doku::store::messages::MessageStore::new(db_pool.clone()),
        file_store: doku::store::files::FileStore::new(db_pool.clone()),
        db_pool,
        openai_client: openai,
        vector_store: vectors,
        stripe_client: stripe,
        stripe_webhook_secret,
        stripe_pro_price_id,
        app_url,
        http_client: reqwest::Client::new(),
    });

    // Build our application with all routes and shared state
    let app = Router::new()
        .merge(handlers::auth::auth_routes())
        .merge(handlers::files::file_routes())
        .merge(handlers::message::message_routes())
        .merge(handlers::upload::upload_routes())
        .merge(handlers::billing::billing_routes())
        .route("/api/status", axum::routing::get(api_status))
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,doku=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,doku=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for production (easier for log aggregation)
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        // Human-readable logging for development
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("📄 Doku starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        }
    );

    let db_configured = std::env::var("DATABASE_URL").is_ok();
    let openai_configured = std::env::var("OPENAI_API_KEY").is_ok();
    let qdrant_configured = std::env::var("QDRANT_URL").is_ok();
    let stripe_configured = std::env::var("STRIPE_SECRET_KEY").is_ok();

    tracing::info!(
        "Configuration - Database: {}, OpenAI: {}, Qdrant: {}, Stripe: {}",
        if db_configured { "✅" } else { "❌" },
        if openai_configured { "✅" } else { "❌" },
        if qdrant_configured { "✅" } else { "❌" },
        if stripe_configured { "✅" } else { "❌" }
    );

    Ok(())
}

// API Status endpoint
async fn api_status(
    Extension(state): Extension<Arc<AppState>>,
) -> axum::response::Json<serde_json::Value> {
    use serde_json::json;

    let db_status = match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    let openai_status = if state.openai_client.is_some() {
        "configured"
    } else {
        "not_configured"
    };
    let qdrant_status = if state.vector_store.is_some() {
        "configured"
    } else {
        "not_configured"
    };
    let stripe_status = if state.stripe_client.is_some() {
        "configured"
    } else {
        "not_configured"
    };

    axum::response::Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "database": db_status,
            "openai": openai_status,
            "qdrant_vector_db": qdrant_status,
            "stripe": stripe_status,
        },
        "features": {
            "document_chat": openai_status == "configured" && qdrant_status == "configured",
            "billing": stripe_status == "configured",
        },
        "endpoints": {
            "status": "/api/status",
            "message": "/api/message",
            "files": "/api/files",
            "webhooks": ["/api/webhooks/stripe", "/api/uploadthing"],
        }
    }))
}
