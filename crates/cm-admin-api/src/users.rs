use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use cm_core::model::{AccountStatus, Contract, Page, Subscription, User};
use cm_core::store::{BillingRepository, ContractRepository, UserRepository};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::require_admin;
use crate::{ApiError, ApiResult, AppState};

const RECENT_CONTRACTS: i64 = 10;

#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDetail {
    pub user: User,
    pub subscription: Option<Subscription>,
    pub recent_contracts: Vec<Contract>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: AccountStatus,
}

pub async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<User>>> {
    require_admin(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    Ok(Json(state.store.list_users(page).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<UserDetail>> {
    require_admin(&state, &headers).await?;
    let user = state
        .store
        .find_user(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    let subscription = state.store.find_subscription(user_id).await?;
    let mut recent_contracts = state
        .store
        .list_contracts(user_id, Page::new(Some(RECENT_CONTRACTS), Some(0))?)
        .await?;
    for contract in &mut recent_contracts {
        contract.extracted_text = None;
    }
    Ok(Json(UserDetail {
        user,
        subscription,
        recent_contracts,
    }))
}

pub async fn update_user_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Json(payload): Json<UpdateStatusRequest>,
) -> ApiResult<Json<User>> {
    let admin = require_admin(&state, &headers).await?;
    if user_id == admin.user_id() {
        return Err(ApiError::bad_request("admins cannot change their own status"));
    }
    let audit = admin.audit(
        "user_status_updated",
        "user",
        user_id,
        Some(json!({ "status": payload.status })),
    );
    let user = state
        .store
        .set_account_status(user_id, payload.status, audit)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    tracing::info!(
        admin_user_id = admin.user_id(),
        user_id,
        status = %payload.status,
        "user status updated"
    );
    Ok(Json(user))
}
