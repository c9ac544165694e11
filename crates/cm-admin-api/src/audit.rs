use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use cm_core::model::{AuditLog, Page};
use cm_core::store::AdminRepository;
use serde::Deserialize;

use crate::auth::require_admin;
use crate::{ApiError, ApiResult, AppState};

#[derive(Deserialize)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_audit_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditLog>>> {
    require_admin(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    let action = query
        .action
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if action.is_some_and(|value| value.len() > 100) {
        return Err(ApiError::bad_request("action is too long"));
    }
    Ok(Json(state.store.list_audit_logs(action, page).await?))
}
