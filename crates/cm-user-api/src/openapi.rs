#![allow(dead_code)]

use axum::http::HeaderMap;
use utoipa::openapi::server::ServerBuilder;
use utoipa::OpenApi;

use crate::{ErrorResponse, HealthStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        healthz_doc,
        metrics_doc,
        openapi_doc,
        auth_register_doc,
        auth_login_doc,
        auth_me_doc,
        auth_profile_doc,
        contracts_list_doc,
        contracts_create_doc,
        contracts_search_doc,
        contracts_get_doc,
        contracts_delete_doc,
        messages_list_doc,
        messages_send_doc,
        suggested_prompts_doc,
        feedback_submit_doc,
        knowledge_list_doc,
        knowledge_create_doc,
        knowledge_delete_doc,
        subscription_get_doc,
        subscription_payments_doc,
        subscription_plans_doc,
        subscription_checkout_doc,
        subscription_cancel_doc,
        payments_config_doc,
        payments_webhook_doc,
        tickets_list_doc,
        tickets_create_doc,
        tickets_get_doc,
        tickets_reply_doc,
        prompts_list_doc,
        rum_ingest_doc
    ),
    components(schemas(HealthStatus, ErrorResponse)),
    tags(
        (name = "user-api", description = "ContraMind user API")
    )
)]
pub struct UserApiDoc;

pub fn document(server_url: Option<&str>) -> utoipa::openapi::OpenApi {
    let mut doc = UserApiDoc::openapi();
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
    post,
    path = "/v1/auth/register",
    request_body = serde_json::Value,
    responses(
        (status = 201, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
        (status = 429, body = ErrorResponse)
    )
)]
fn auth_register_doc() {}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = serde_json::Value,
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 429, body = ErrorResponse)
    )
)]
fn auth_login_doc() {}

#[utoipa::path(
    get,
    path = "/v1/auth/me",
    responses((status = 200, body = serde_json::Value), (status = 401, body = ErrorResponse))
)]
fn auth_me_doc() {}

#[utoipa::path(
    patch,
    path = "/v1/auth/profile",
    request_body = serde_json::Value,
    responses(
        (status = 200, body = serde_json::Value),
        (status = 401, body = ErrorResponse),
        (status = 409, body = ErrorResponse)
    )
)]
fn auth_profile_doc() {}

#[utoipa::path(
    get,
    path = "/v1/contracts",
    params(
        ("limit" = Option<i64>, Query, description = "Page size (1-100)"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse)
    )
)]
fn contracts_list_doc() {}

#[utoipa::path(
    post,
    path = "/v1/contracts",
    request_body = serde_json::Value,
    responses(
        (status = 201, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
        (status = 429, body = ErrorResponse)
    )
)]
fn contracts_create_doc() {}

#[utoipa::path(
    get,
    path = "/v1/contracts/search",
    params(
        ("q" = String, Query, description = "Filename substring"),
        ("limit" = Option<i64>, Query, description = "Page size (1-100)"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    responses((status = 200, body = serde_json::Value), (status = 400, body = ErrorResponse))
)]
fn contracts_search_doc() {}

#[utoipa::path(
    get,
    path = "/v1/contracts/{contract_id}",
    params(("contract_id" = i64, Path, description = "Contract identifier")),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn contracts_get_doc() {}

#[utoipa::path(
    delete,
    path = "/v1/contracts/{contract_id}",
    params(("contract_id" = i64, Path, description = "Contract identifier")),
    responses(
        (status = 204, description = "No content"),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn contracts_delete_doc() {}

#[utoipa::path(
    get,
    path = "/v1/contracts/{contract_id}/messages",
    params(("contract_id" = i64, Path, description = "Contract identifier")),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn messages_list_doc() {}

#[utoipa::path(
    post,
    path = "/v1/contracts/{contract_id}/messages",
    params(("contract_id" = i64, Path, description = "Contract identifier")),
    request_body = serde_json::Value,
    responses(
        (status = 200, body = serde_json::Value),
        (status = 403, body = ErrorResponse),
        (status = 412, body = ErrorResponse),
        (status = 502, body = ErrorResponse)
    )
)]
fn messages_send_doc() {}

#[utoipa::path(
    get,
    path = "/v1/contracts/{contract_id}/suggested-prompts",
    params(("contract_id" = i64, Path, description = "Contract identifier")),
    responses((status = 200, body = serde_json::Value), (status = 404, body = ErrorResponse))
)]
fn suggested_prompts_doc() {}

#[utoipa::path(
    put,
    path = "/v1/messages/{message_id}/feedback",
    params(("message_id" = i64, Path, description = "Assistant message identifier")),
    request_body = serde_json::Value,
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn feedback_submit_doc() {}

#[utoipa::path(
    get,
    path = "/v1/knowledge",
    responses((status = 200, body = serde_json::Value), (status = 401, body = ErrorResponse))
)]
fn knowledge_list_doc() {}

#[utoipa::path(
    post,
    path = "/v1/knowledge",
    request_body = serde_json::Value,
    responses((status = 201, body = serde_json::Value), (status = 400, body = ErrorResponse))
)]
fn knowledge_create_doc() {}

#[utoipa::path(
    delete,
    path = "/v1/knowledge/{document_id}",
    params(("document_id" = i64, Path, description = "Document identifier")),
    responses(
        (status = 204, description = "No content"),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn knowledge_delete_doc() {}

#[utoipa::path(
    get,
    path = "/v1/subscription",
    responses((status = 200, body = serde_json::Value), (status = 401, body = ErrorResponse))
)]
fn subscription_get_doc() {}

#[utoipa::path(
    get,
    path = "/v1/subscription/payments",
    params(
        ("limit" = Option<i64>, Query, description = "Page size (1-100)"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    responses((status = 200, body = serde_json::Value), (status = 400, body = ErrorResponse))
)]
fn subscription_payments_doc() {}

#[utoipa::path(
    get,
    path = "/v1/subscription/plans",
    responses((status = 200, body = serde_json::Value))
)]
fn subscription_plans_doc() {}

#[utoipa::path(
    post,
    path = "/v1/subscription/checkout",
    request_body = serde_json::Value,
    responses(
        (status = 200, body = serde_json::Value),
        (status = 502, body = ErrorResponse),
        (status = 503, body = ErrorResponse)
    )
)]
fn subscription_checkout_doc() {}

#[utoipa::path(
    post,
    path = "/v1/subscription/cancel",
    responses((status = 200, body = serde_json::Value), (status = 404, body = ErrorResponse))
)]
fn subscription_cancel_doc() {}

#[utoipa::path(
    get,
    path = "/v1/payments/config",
    responses((status = 200, body = serde_json::Value))
)]
fn payments_config_doc() {}

#[utoipa::path(
    post,
    path = "/v1/payments/webhook",
    request_body = serde_json::Value,
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
        (status = 502, body = ErrorResponse)
    )
)]
fn payments_webhook_doc() {}

#[utoipa::path(
    get,
    path = "/v1/support/tickets",
    params(
        ("limit" = Option<i64>, Query, description = "Page size (1-100)"),
        ("offset" = Option<i64>, Query, description = "Rows to skip")
    ),
    responses((status = 200, body = serde_json::Value), (status = 401, body = ErrorResponse))
)]
fn tickets_list_doc() {}

#[utoipa::path(
    post,
    path = "/v1/support/tickets",
    request_body = serde_json::Value,
    responses((status = 201, body = serde_json::Value), (status = 400, body = ErrorResponse))
)]
fn tickets_create_doc() {}

#[utoipa::path(
    get,
    path = "/v1/support/tickets/{ticket_id}",
    params(("ticket_id" = i64, Path, description = "Ticket identifier")),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn tickets_get_doc() {}

#[utoipa::path(
    post,
    path = "/v1/support/tickets/{ticket_id}/messages",
    params(("ticket_id" = i64, Path, description = "Ticket identifier")),
    request_body = serde_json::Value,
    responses(
        (status = 201, body = serde_json::Value),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse)
    )
)]
fn tickets_reply_doc() {}

#[utoipa::path(
    get,
    path = "/v1/prompts",
    params(("category" = Option<String>, Query, description = "Prompt category")),
    responses((status = 200, body = serde_json::Value))
)]
fn prompts_list_doc() {}

#[utoipa::path(
    post,
    path = "/v1/rum",
    request_body = serde_json::Value,
    responses(
        (status = 201, body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 429, body = ErrorResponse)
    )
)]
fn rum_ingest_doc() {}
