use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use cm_core::model::{KnowledgeDocument, NewKnowledgeDocument};
use cm_core::store::KnowledgeRepository;
use serde::Deserialize;

use crate::auth::require_auth;
use crate::contracts::{validate_upload, UploadedFile};
use crate::{ApiError, ApiResult, AppState};

const MAX_DESCRIPTION_CHARS: usize = 1_000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub filename: String,
    pub storage_key: String,
    pub storage_url: String,
    pub file_size: i64,
    pub mime_type: String,
    pub description: Option<String>,
    pub extracted_text: Option<String>,
}

pub async fn list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<KnowledgeDocument>>> {
    let auth = require_auth(&state, &headers).await?;
    let documents = state.store.list_documents(auth.user_id()).await?;
    Ok(Json(documents))
}

pub async fn create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateDocumentRequest>,
) -> ApiResult<(StatusCode, Json<KnowledgeDocument>)> {
    let auth = require_auth(&state, &headers).await?;
    validate_upload(
        &UploadedFile {
            filename: &payload.filename,
            storage_key: &payload.storage_key,
            storage_url: &payload.storage_url,
            file_size: payload.file_size,
            mime_type: &payload.mime_type,
        },
        &state.storage,
    )?;
    let description = payload
        .description
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if description
        .as_ref()
        .is_some_and(|value| value.chars().count() > MAX_DESCRIPTION_CHARS)
    {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!("description must be at most {MAX_DESCRIPTION_CHARS} characters"),
        ));
    }

    let document = state
        .store
        .create_document(NewKnowledgeDocument {
            user_id: auth.user_id(),
            filename: payload.filename.trim().to_string(),
            storage_key: payload.storage_key.trim().to_string(),
            storage_url: payload.storage_url,
            file_size: payload.file_size,
            mime_type: payload.mime_type,
            extracted_text: payload.extracted_text,
            description,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(document_id): Path<i64>,
) -> ApiResult<StatusCode> {
    let auth = require_auth(&state, &headers).await?;
    let document = state
        .store
        .find_document(document_id)
        .await?
        .ok_or_else(|| ApiError::not_found("document not found"))?;
    auth.ensure_can_access(document.user_id)?;

    if !state.store.delete_document(document_id).await? {
        return Err(ApiError::not_found("document not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}
