use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use cm_core::email;
use cm_core::model::{
    NewTicket, Page, SenderType, SupportTicket, TicketMessage, TicketPriority, TicketStatus,
};
use cm_core::store::{SupportRepository, UserRepository};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::auth::require_auth;
use crate::contracts::PageQuery;
use crate::{ApiError, ApiResult, AppState};

const MAX_SUBJECT_CHARS: usize = 200;
const MAX_MESSAGE_CHARS: usize = 5_000;

#[derive(Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub message: String,
    pub priority: Option<TicketPriority>,
}

#[derive(Deserialize)]
pub struct ReplyRequest {
    pub message: String,
}

#[derive(Serialize)]
pub struct TicketDetail {
    pub ticket: SupportTicket,
    pub messages: Vec<TicketMessage>,
}

/// `TKT-<unix millis>-<6 uppercase alphanumerics>`.
pub(crate) fn generate_ticket_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|byte| char::from(byte).to_ascii_uppercase())
        .collect();
    format!("TKT-{}-{suffix}", Utc::now().timestamp_millis())
}

#[allow(clippy::result_large_err)]
fn bounded_text(value: &str, field: &str, max: usize) -> ApiResult<String> {
    let value = value.trim();
    if value.is_empty() || value.chars().count() > max {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!("{field} must be 1 to {max} characters"),
        ));
    }
    Ok(value.to_string())
}

pub async fn list_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<SupportTicket>>> {
    let auth = require_auth(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    let tickets = state.store.list_user_tickets(auth.user_id(), page).await?;
    Ok(Json(tickets))
}

pub async fn create_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTicketRequest>,
) -> ApiResult<(StatusCode, Json<SupportTicket>)> {
    let auth = require_auth(&state, &headers).await?;
    let subject = bounded_text(&payload.subject, "subject", MAX_SUBJECT_CHARS)?;
    let message = bounded_text(&payload.message, "message", MAX_MESSAGE_CHARS)?;

    let ticket = state
        .store
        .create_ticket(NewTicket {
            ticket_number: generate_ticket_number(),
            user_id: auth.user_id(),
            subject,
            priority: payload.priority.unwrap_or(TicketPriority::Medium),
            message,
        })
        .await?;
    tracing::info!(
        ticket_id = ticket.id,
        ticket_number = %ticket.ticket_number,
        "support ticket created"
    );
    Ok((StatusCode::CREATED, Json(ticket)))
}

pub async fn get_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ticket_id): Path<i64>,
) -> ApiResult<Json<TicketDetail>> {
    let auth = require_auth(&state, &headers).await?;
    let ticket = state
        .store
        .find_ticket(ticket_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ticket not found"))?;
    auth.ensure_can_access(ticket.user_id)?;
    let messages = state.store.list_ticket_messages(ticket_id).await?;
    Ok(Json(TicketDetail { ticket, messages }))
}

pub async fn reply_to_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ticket_id): Path<i64>,
    Json(payload): Json<ReplyRequest>,
) -> ApiResult<(StatusCode, Json<TicketMessage>)> {
    let auth = require_auth(&state, &headers).await?;
    let message = bounded_text(&payload.message, "message", MAX_MESSAGE_CHARS)?;
    let ticket = state
        .store
        .find_ticket(ticket_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ticket not found"))?;
    auth.ensure_can_access(ticket.user_id)?;
    if ticket.status == TicketStatus::Closed {
        return Err(ApiError::bad_request("INVALID_REQUEST", "ticket is closed"));
    }

    let sender_type = if auth.is_admin() {
        SenderType::Admin
    } else {
        SenderType::User
    };
    let reply = state
        .store
        .add_ticket_message(ticket_id, auth.user_id(), sender_type, &message)
        .await?;

    if sender_type == SenderType::Admin && ticket.user_id != auth.user_id() {
        match state.store.find_user(ticket.user_id).await {
            Ok(Some(owner)) => state.email.send_in_background(email::ticket_reply(
                &owner.email,
                owner.name.as_deref(),
                &ticket.ticket_number,
                &message,
            )),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(ticket_id, error = %err, "ticket owner lookup failed");
            }
        }
    }

    Ok((StatusCode::CREATED, Json(reply)))
}
