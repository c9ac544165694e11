#![allow(dead_code)]

use axum::http::HeaderMap;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::openapi::server::ServerBuilder;
use utoipa::{Modify, OpenApi};

use crate::{ErrorResponse, HealthStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        healthz_doc,
        metrics_doc,
        openapi_doc,
        admin_me_doc,
        dashboard_doc,
        users_list_doc,
        users_get_doc,
        users_status_doc,
        tickets_list_doc,
        tickets_get_doc,
        tickets_update_doc,
        services_list_doc,
        services_get_doc,
        services_update_doc,
        audit_logs_doc,
        rum_list_doc
    ),
    components(schemas(HealthStatus, ErrorResponse)),
    modifiers(&BearerAuth),
    tags(
        (name = "admin-api", description = "ContraMind admin console API")
    )
)]
pub struct AdminApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

pub fn document(server_url: Option<&str>) -> utoipa::openapi::OpenApi {
    let mut doc = AdminApiDoc::openapi();
    if let Some(url) = server_url {
        doc.servers = Some(vec![ServerBuilder::new().url(url).build()]);
    }
    doc
}

pub fn infer_server_url(headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|value| value.to_str().ok())?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    Some(format!("{proto}://{host}"))
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, body = HealthStatus), (status = 503, body = HealthStatus))
)]
fn healthz_doc() {}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, content_type = "text/plain", body = String))
)]
fn metrics_doc() {}

#[utoipa::path(
    get,
    path = "/v1/openapi.json",
    responses((status = 200, body = serde_json::Value))
)]
fn openapi_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/me",
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn admin_me_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/dashboard",
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn dashboard_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/users",
    params(
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn users_list_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/users/{user_id}",
    params(
        ("user_id" = i64, Path, description = "User id")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn users_get_doc() {}

#[utoipa::path(
    patch,
    path = "/v1/admin/users/{user_id}/status",
    request_body = serde_json::Value,
    params(
        ("user_id" = i64, Path, description = "User id")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn users_status_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/tickets",
    params(
        ("status" = Option<String>, Query, description = "Ticket status filter"),
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn tickets_list_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/tickets/{ticket_id}",
    params(
        ("ticket_id" = i64, Path, description = "Ticket id")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn tickets_get_doc() {}

#[utoipa::path(
    patch,
    path = "/v1/admin/tickets/{ticket_id}",
    request_body = serde_json::Value,
    params(
        ("ticket_id" = i64, Path, description = "Ticket id")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn tickets_update_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/services",
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn services_list_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/services/{service}/config",
    params(
        ("service" = String, Path, description = "Service name")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn services_get_doc() {}

#[utoipa::path(
    put,
    path = "/v1/admin/services/{service}/config",
    request_body = serde_json::Value,
    params(
        ("service" = String, Path, description = "Service name")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
        (status = 409, body = ErrorResponse)
    )
)]
fn services_update_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/audit-logs",
    params(
        ("action" = Option<String>, Query, description = "Audit action filter"),
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn audit_logs_doc() {}

#[utoipa::path(
    get,
    path = "/v1/admin/rum",
    params(
        ("limit" = Option<i64>, Query, description = "Page size"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse)
    )
)]
fn rum_list_doc() {}
