pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod openai_client;
pub mod pdf;
pub mod pipeline;
pub mod plans;
pub mod store;
pub mod stripe_client;
pub mod sync;
pub mod vector_store;

// AppState holds the database pool, the stores wrapping it, and the vendor
// API clients — constructed once at startup and shared across requests.
pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub message_store: store::messages::MessageStore,
    pub file_store: store::files::FileStore,
    pub openai_client: Option<openai_client::OpenAiClient>,
    pub vector_store: Option<vector_store::VectorStore>,
    pub stripe_client: Option<stripe_client::StripeClient>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_pro_price_id: Option<String>,
    /// Base URL of the deployment, for billing redirect targets.
    pub app_url: String,
    /// Plain HTTP client for fetching uploaded objects from storage.
    pub http_client: reqwest::Client,
}
