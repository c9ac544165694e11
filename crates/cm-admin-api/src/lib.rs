use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, patch};
use axum::{Json, Router};
use cm_core::auth::JwtConfig;
use cm_core::model::PageError;
use cm_core::store::{PgStore, Store, StoreError};
use cm_core::{config, http, logging, metrics, server};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;

mod audit;
mod auth;
mod dashboard;
mod openapi;
mod rum;
mod services;
mod tickets;
mod users;

#[cfg(test)]
mod openapi_contract_tests;

pub(crate) const SERVICE_NAME: &str = "cm-admin-api";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) jwt_config: Arc<JwtConfig>,
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

    pub(crate) fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.push((HeaderName::from_static(name), value));
        }
        self
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
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
        ApiError::new(StatusCode::BAD_REQUEST, "INVALID_PAGINATION", err.to_string())
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

pub struct AdminApiConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub allowed_origins: Vec<String>,
}

pub fn load_config() -> Result<AdminApiConfig> {
    Ok(AdminApiConfig {
        addr: config::socket_addr_from_env("ADMIN_API_ADDR", "0.0.0.0:8081")?,
        database_url: config::required_env("DATABASE_URL")?,
        allowed_origins: config::list_env("ALLOWED_ORIGINS"),
    })
}

pub async fn run(config: AdminApiConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url, 5).await?);
    let state = AppState {
        store,
        jwt_config: Arc::new(JwtConfig::from_env()?),
    };

    let router = build_router(state);
    let router = http::apply_standard_layers(router, SERVICE_NAME, &config.allowed_origins);
    server::serve(config.addr, router).await
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/v1/openapi.json", get(openapi_json))
        .route("/v1/admin/me", get(auth::me))
        .route("/v1/admin/dashboard", get(dashboard::get_dashboard))
        .route("/v1/admin/users", get(users::list_users))
        .route("/v1/admin/users/:user_id", get(users::get_user))
        .route("/v1/admin/users/:user_id/status", patch(users::update_user_status))
        .route("/v1/admin/tickets", get(tickets::list_tickets))
        .route(
            "/v1/admin/tickets/:ticket_id",
            get(tickets::get_ticket).patch(tickets::update_ticket),
        )
        .route("/v1/admin/services", get(services::list_services))
        .route(
            "/v1/admin/services/:service/config",
            get(services::get_service_config).put(services::update_service_config),
        )
        .route("/v1/admin/audit-logs", get(audit::list_audit_logs))
        .route("/v1/admin/rum", get(rum::list_rum_metrics))
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
