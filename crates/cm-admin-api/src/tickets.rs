use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use cm_core::model::{
    Page, SupportTicket, TicketMessage, TicketPriority, TicketStatus, TicketUpdate,
};
use cm_core::store::{SupportRepository, UserRepository};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::require_admin;
use crate::{ApiError, ApiResult, AppState};

#[derive(Deserialize)]
pub struct TicketQuery {
    pub status: Option<TicketStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTicketRequest {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub assigned_to: Option<i64>,
}

#[derive(Serialize)]
pub struct TicketDetail {
    pub ticket: SupportTicket,
    pub messages: Vec<TicketMessage>,
}

pub async fn list_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TicketQuery>,
) -> ApiResult<Json<Vec<SupportTicket>>> {
    require_admin(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    Ok(Json(state.store.list_tickets(query.status, page).await?))
}

pub async fn get_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ticket_id): Path<i64>,
) -> ApiResult<Json<TicketDetail>> {
    require_admin(&state, &headers).await?;
    let ticket = state
        .store
        .find_ticket(ticket_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ticket not found"))?;
    let messages = state.store.list_ticket_messages(ticket_id).await?;
    Ok(Json(TicketDetail { ticket, messages }))
}

pub async fn update_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ticket_id): Path<i64>,
    Json(payload): Json<UpdateTicketRequest>,
) -> ApiResult<Json<SupportTicket>> {
    let admin = require_admin(&state, &headers).await?;
    if payload.status.is_none() && payload.priority.is_none() && payload.assigned_to.is_none() {
        return Err(ApiError::bad_request("nothing to update"));
    }
    if let Some(assignee) = payload.assigned_to {
        let is_admin = state
            .store
            .find_user(assignee)
            .await?
            .is_some_and(|user| user.is_admin());
        if !is_admin {
            return Err(ApiError::bad_request("tickets can only be assigned to admins"));
        }
    }

    let audit = admin.audit(
        "ticket_updated",
        "support_ticket",
        ticket_id,
        Some(json!({
            "status": payload.status,
            "priority": payload.priority,
            "assignedTo": payload.assigned_to,
        })),
    );
    let update = TicketUpdate {
        status: payload.status,
        priority: payload.priority,
        assigned_to: payload.assigned_to,
    };
    let ticket = state
        .store
        .update_ticket(ticket_id, update, audit)
        .await?
        .ok_or_else(|| ApiError::not_found("ticket not found"))?;
    Ok(Json(ticket))
}
