use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use cm_analysis::chat::{self, ChatError, ChatRequest, DEFAULT_HISTORY_WINDOW};
use cm_analysis::config::AnalysisRuntimeConfig;
use cm_analysis::prompt;
use cm_core::model::{AiMessage, Feedback, FeedbackRating, Language, MessageRole};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::require_auth;
use crate::contracts::load_contract;
use crate::{ApiError, ApiResult, AppState};

const MAX_MESSAGE_CHARS: usize = 10_000;
const MAX_COMMENT_CHARS: usize = 2_000;
const MAX_HISTORY_WINDOW: u64 = 50;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub prompt_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub user_message_id: i64,
    pub ai_message_id: i64,
    pub response: String,
}

#[derive(Serialize)]
pub struct SuggestedPromptsResponse {
    pub language: Language,
    pub prompts: Vec<&'static str>,
}

#[derive(Deserialize)]
pub struct FeedbackRequest {
    pub rating: FeedbackRating,
    pub comment: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<i64>,
) -> ApiResult<Json<Vec<AiMessage>>> {
    let auth = require_auth(&state, &headers).await?;
    load_contract(&state, &auth, contract_id).await?;
    let messages = state.store.list_messages(contract_id).await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<i64>,
    Json(payload): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    let auth = require_auth(&state, &headers).await?;
    let content = payload.content.trim();
    if content.is_empty() || content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!("message must be 1 to {MAX_MESSAGE_CHARS} characters"),
        ));
    }

    let contract = state
        .store
        .find_contract(contract_id)
        .await?
        .ok_or_else(|| ApiError::not_found("contract not found"))?;
    if contract.user_id != auth.user_id() {
        return Err(ApiError::forbidden("only the contract owner can chat"));
    }

    let history_window = current_history_window(&state).await;
    let runtime = AnalysisRuntimeConfig::from_json(&state.analysis_config.get().await.config_json);
    let exchange = chat::exchange(
        state.store.as_ref(),
        &state.llm,
        crate::SERVICE_NAME,
        &contract,
        ChatRequest {
            user_id: auth.user_id(),
            content,
            prompt_type: payload.prompt_type,
            history_window,
            timeout: chat_model_timeout(runtime.llm.request_timeout(), state.request_timeout),
        },
    )
    .await
    .map_err(|err| match err {
        ChatError::NotAnalyzed => ApiError::new(
            StatusCode::PRECONDITION_FAILED,
            "CONTRACT_NOT_ANALYZED",
            "contract has not been analyzed yet",
        ),
        ChatError::Model(_) => ApiError::new(
            StatusCode::BAD_GATEWAY,
            "AI_UNAVAILABLE",
            "failed to generate AI response",
        ),
        ChatError::Store(err) => err.into(),
    })?;

    Ok(Json(SendMessageResponse {
        user_message_id: exchange.user_message.id,
        ai_message_id: exchange.assistant_message.id,
        response: exchange.assistant_message.content,
    }))
}

/// The model call has to give up before the HTTP timeout layer does, so the
/// caller gets `AI_UNAVAILABLE` rather than a bare 408.
fn chat_model_timeout(configured: Duration, request_timeout: Duration) -> Duration {
    configured.min(request_timeout.saturating_sub(request_timeout / 5))
}

pub async fn suggested_prompts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<i64>,
) -> ApiResult<Json<SuggestedPromptsResponse>> {
    let auth = require_auth(&state, &headers).await?;
    let contract = load_contract(&state, &auth, contract_id).await?;
    let language = prompt::chat_language(contract.detected_language);
    Ok(Json(SuggestedPromptsResponse {
        language,
        prompts: prompt::suggested_prompts(language).to_vec(),
    }))
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
    Json(payload): Json<FeedbackRequest>,
) -> ApiResult<Json<Feedback>> {
    let auth = require_auth(&state, &headers).await?;
    let comment = payload
        .comment
        .map(|comment| comment.trim().to_string())
        .filter(|comment| !comment.is_empty());
    if comment
        .as_ref()
        .is_some_and(|comment| comment.chars().count() > MAX_COMMENT_CHARS)
    {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!("comment must be at most {MAX_COMMENT_CHARS} characters"),
        ));
    }

    let message = state
        .store
        .find_message(message_id)
        .await?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    if message.role != MessageRole::Assistant {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "feedback is only accepted for assistant messages",
        ));
    }
    let contract = state
        .store
        .find_contract(message.contract_id)
        .await?
        .ok_or_else(|| ApiError::not_found("contract not found"))?;
    if contract.user_id != auth.user_id() {
        return Err(ApiError::forbidden("not the owner of this conversation"));
    }

    let feedback = state
        .store
        .upsert_feedback(message_id, auth.user_id(), payload.rating, comment)
        .await?;
    Ok(Json(feedback))
}

pub(crate) async fn current_history_window(state: &AppState) -> usize {
    let snapshot = state.user_config.get().await;
    snapshot
        .config_json
        .pointer("/chat/history_window")
        .and_then(|value| value.as_u64())
        .map(|value| value.min(MAX_HISTORY_WINDOW) as usize)
        .unwrap_or(DEFAULT_HISTORY_WINDOW)
}
