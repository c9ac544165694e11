use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use cm_analysis::config::AnalysisRuntimeConfig;
use cm_analysis::extract::StoragePolicy;
use cm_analysis::llm::{self, LlmProviderKind, LlmSettings};
use cm_analysis::JobSignal;
use cm_core::auth::JwtConfig;
use cm_core::email::EmailClient;
use cm_core::model::PageError;
use cm_core::payment::{PaymentGateway, TapConfig};
use cm_core::rate_limit::RateLimiter;
use cm_core::service_config::{self, ServiceConfigHandle};
use cm_core::store::{PgStore, Store, StoreError};
use cm_core::{config, http, logging, metrics, server};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod auth;
mod billing;
mod chat;
mod contracts;
mod knowledge;
mod openapi;
mod prompts;
mod rum;
mod support;

#[cfg(test)]
mod openapi_contract_tests;

pub(crate) const SERVICE_NAME: &str = "cm-user-api";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) jwt_config: Arc<JwtConfig>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) user_config: ServiceConfigHandle,
    pub(crate) analysis_config: ServiceConfigHandle,
    pub(crate) llm: LlmProviderKind,
    pub(crate) payments: PaymentGateway,
    pub(crate) email: EmailClient,
    pub(crate) jobs: JobSignal,
    pub(crate) owner_email: Option<String>,
    pub(crate) public_base_url: Option<String>,
    pub(crate) storage: StoragePolicy,
    /// Budget enforced by the HTTP timeout layer around every handler.
    pub(crate) request_timeout: Duration,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct ErrorResponse {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            headers: Vec::new(),
        }
    }

    pub(crate) fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub(crate) fn with_header(mut self, name: &'static str, value: String) -> Self {
        if let Ok(value) = HeaderValue::from_str(&value) {
            self.headers.push((HeaderName::from_static(name), value));
        }
        self
    }

    pub(crate) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            err.to_string(),
        )
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::not_found("record not found"),
            StoreError::Conflict(message) => ApiError::new(StatusCode::CONFLICT, "CONFLICT", message),
            other => {
                tracing::error!(error = %other, "store operation failed");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DB_ERROR",
                    other.to_string(),
                )
            }
        }
    }
}

impl From<PageError> for ApiError {
    fn from(err: PageError) -> Self {
        ApiError::bad_request("INVALID_PAGINATION", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        let mut response = (self.status, Json(payload)).into_response();
        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct HealthStatus {
    status: String,
}

pub struct UserApiConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub allowed_origins: Vec<String>,
    pub config_poll_seconds: u64,
    pub owner_email: Option<String>,
    pub public_base_url: Option<String>,
    pub analysis_worker_enabled: bool,
    pub storage: StoragePolicy,
}

pub fn load_config() -> Result<UserApiConfig> {
    Ok(UserApiConfig {
        addr: config::socket_addr_from_env("USER_API_ADDR", "0.0.0.0:8080")?,
        database_url: config::required_env("DATABASE_URL")?,
        allowed_origins: config::list_env("ALLOWED_ORIGINS"),
        config_poll_seconds: config::parse_env("CONFIG_POLL_SECONDS", 30u64)?,
        owner_email: config::optional_env("OWNER_EMAIL"),
        public_base_url: config::optional_env("PUBLIC_BASE_URL"),
        analysis_worker_enabled: config::bool_env("ANALYSIS_WORKER_ENABLED", true),
        storage: StoragePolicy::from_env()?,
    })
}

/// Runtime defaults used until an admin stores a `user-api` config.
pub fn default_user_config() -> Value {
    json!({
        "rate_limit": {
            "enabled": true,
            "auth_per_minute": 5,
            "upload_per_15min": 30,
            "rum_per_15min": 100,
            "webhook_per_15min": 60
        },
        "chat": {
            "history_window": cm_analysis::chat::DEFAULT_HISTORY_WINDOW
        }
    })
}

pub async fn run(config: UserApiConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url, 10).await?);
    let config_poll = Duration::from_secs(config.config_poll_seconds);
    let user_config = service_config::watch_service_config(
        Arc::clone(&store),
        service_config::USER_API_SERVICE,
        default_user_config(),
        config_poll,
    )
    .await?;
    let analysis_config = service_config::watch_service_config(
        Arc::clone(&store),
        service_config::ANALYSIS_SERVICE,
        AnalysisRuntimeConfig::default_json(),
        config_poll,
    )
    .await?;

    let jobs = JobSignal::new();
    if config.analysis_worker_enabled {
        let context = cm_analysis::build_context(
            Arc::clone(&store),
            jobs.clone(),
            SERVICE_NAME,
            config_poll,
            config.storage.clone(),
        )
        .await?;
        cm_analysis::spawn_job_worker(context);
        tracing::info!("embedded analysis worker started");
    }

    let state = AppState {
        store,
        jwt_config: Arc::new(JwtConfig::from_env()?),
        rate_limiter: Arc::new(RateLimiter::new()),
        user_config,
        analysis_config,
        llm: llm::build_provider(&LlmSettings::from_env())?,
        payments: PaymentGateway::new(TapConfig::from_env())?,
        email: EmailClient::from_env()?,
        jobs,
        owner_email: config.owner_email,
        public_base_url: config.public_base_url,
        storage: config.storage,
        request_timeout: http::REQUEST_TIMEOUT,
    };
    if !state.payments.is_configured() {
        tracing::warn!("payment gateway not configured; checkout is disabled");
    }

    let request_timeout = state.request_timeout;
    let router = build_router(state);
    let router = http::apply_layers_with_timeout(
        router,
        SERVICE_NAME,
        &config.allowed_origins,
        request_timeout,
    );
    server::serve(config.addr, router).await
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/v1/openapi.json", get(openapi_json))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/me", get(auth::me))
        .route("/v1/auth/profile", axum::routing::patch(auth::update_profile))
        .route(
            "/v1/contracts",
            get(contracts::list_contracts).post(contracts::create_contract),
        )
        .route("/v1/contracts/search", get(contracts::search_contracts))
        .route(
            "/v1/contracts/:contract_id",
            get(contracts::get_contract).delete(contracts::delete_contract),
        )
        .route(
            "/v1/contracts/:contract_id/messages",
            get(chat::list_messages).post(chat::send_message),
        )
        .route(
            "/v1/contracts/:contract_id/suggested-prompts",
            get(chat::suggested_prompts),
        )
        .route("/v1/messages/:message_id/feedback", put(chat::submit_feedback))
        .route(
            "/v1/knowledge",
            get(knowledge::list_documents).post(knowledge::create_document),
        )
        .route("/v1/knowledge/:document_id", delete(knowledge::delete_document))
        .route("/v1/subscription", get(billing::current_subscription))
        .route("/v1/subscription/payments", get(billing::list_payments))
        .route("/v1/subscription/plans", get(billing::list_plans))
        .route("/v1/subscription/checkout", post(billing::checkout))
        .route("/v1/subscription/cancel", post(billing::cancel_subscription))
        .route("/v1/payments/config", get(billing::payment_config))
        .route("/v1/payments/webhook", post(billing::payment_webhook))
        .route(
            "/v1/support/tickets",
            get(support::list_tickets).post(support::create_ticket),
        )
        .route("/v1/support/tickets/:ticket_id", get(support::get_ticket))
        .route(
            "/v1/support/tickets/:ticket_id/messages",
            post(support::reply_to_ticket),
        )
        .route("/v1/prompts", get(prompts::list_prompts))
        .route("/v1/rum", post(rum::ingest_metric))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, Json(HealthStatus { status: "ok".into() })),
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable".into(),
                }),
            )
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}

pub(crate) async fn openapi_json(headers: HeaderMap) -> impl IntoResponse {
    let server_url = openapi::infer_server_url(&headers);
    Json(openapi::document(server_url.as_deref()))
}
