use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use cm_analysis::config::AnalysisRuntimeConfig;
use cm_analysis::extract::{StoragePolicy, MAX_DOCUMENT_BYTES, SUPPORTED_UPLOAD_TYPES};
use cm_core::model::{Contract, ContractStatus, NewContract, Page};
use cm_core::rate_limit::RateRule;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{current_rate_limit, enforce_rate_limit, require_auth, AuthContext};
use crate::{ApiError, ApiResult, AppState};

const MAX_FILENAME_CHARS: usize = 500;
const MAX_STORAGE_KEY_CHARS: usize = 500;
const MAX_SEARCH_CHARS: usize = 200;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContractRequest {
    pub filename: String,
    pub storage_key: String,
    pub storage_url: String,
    pub file_size: i64,
    pub mime_type: String,
}

#[derive(Serialize)]
pub struct CreateContractResponse {
    pub id: i64,
    pub status: ContractStatus,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Fields every uploaded file reference carries.
pub(crate) struct UploadedFile<'a> {
    pub filename: &'a str,
    pub storage_key: &'a str,
    pub storage_url: &'a str,
    pub file_size: i64,
    pub mime_type: &'a str,
}

#[allow(clippy::result_large_err)]
pub(crate) fn validate_upload(file: &UploadedFile<'_>, storage: &StoragePolicy) -> ApiResult<()> {
    let invalid = |field: &str, message: String| {
        ApiError::bad_request("INVALID_FILE", message).with_details(json!({ "field": field }))
    };

    let filename_chars = file.filename.trim().chars().count();
    if filename_chars == 0 || filename_chars > MAX_FILENAME_CHARS {
        return Err(invalid(
            "filename",
            format!("filename must be 1 to {MAX_FILENAME_CHARS} characters"),
        ));
    }
    let key_chars = file.storage_key.trim().chars().count();
    if key_chars == 0 || key_chars > MAX_STORAGE_KEY_CHARS {
        return Err(invalid(
            "storageKey",
            format!("storage key must be 1 to {MAX_STORAGE_KEY_CHARS} characters"),
        ));
    }
    if let Err(err) = storage.check(file.storage_url) {
        return Err(invalid("storageUrl", err.to_string()));
    }
    if file.file_size <= 0 || file.file_size > MAX_DOCUMENT_BYTES as i64 {
        return Err(invalid(
            "fileSize",
            format!("file size must be between 1 byte and {MAX_DOCUMENT_BYTES} bytes"),
        ));
    }
    if !SUPPORTED_UPLOAD_TYPES.contains(&file.mime_type) {
        return Err(ApiError::bad_request(
            "INVALID_FILE",
            format!("unsupported file type: {}", file.mime_type),
        )
        .with_details(json!({ "field": "mimeType", "supported": SUPPORTED_UPLOAD_TYPES })));
    }
    Ok(())
}

pub async fn create_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateContractRequest>,
) -> ApiResult<(StatusCode, Json<CreateContractResponse>)> {
    let auth = require_auth(&state, &headers).await?;

    let rate = current_rate_limit(&state).await;
    if rate.enabled {
        let key = format!("upload:{}", auth.user_id());
        enforce_rate_limit(
            &state,
            "upload",
            &key,
            RateRule::per_quarter_hour(rate.upload_per_15min),
        )
        .await?;
    }

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

    let runtime = AnalysisRuntimeConfig::from_json(&state.analysis_config.get().await.config_json);
    let (contract, job) = state
        .store
        .create_contract_with_job(
            NewContract {
                user_id: auth.user_id(),
                filename: payload.filename.trim().to_string(),
                storage_key: payload.storage_key.trim().to_string(),
                storage_url: payload.storage_url,
                file_size: payload.file_size,
                mime_type: payload.mime_type,
            },
            runtime.max_attempts,
        )
        .await?;
    state.jobs.notify();
    tracing::info!(
        contract_id = contract.id,
        job_id = %job.job_id,
        user_id = auth.user_id(),
        "contract uploaded"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateContractResponse {
            id: contract.id,
            status: contract.status,
        }),
    ))
}

pub async fn list_contracts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<Contract>>> {
    let auth = require_auth(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    let contracts = state.store.list_contracts(auth.user_id(), page).await?;
    Ok(Json(contracts.into_iter().map(without_text).collect()))
}

pub async fn search_contracts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Contract>>> {
    let auth = require_auth(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    let needle = query.q.trim();
    if needle.is_empty() || needle.chars().count() > MAX_SEARCH_CHARS {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!("query must be 1 to {MAX_SEARCH_CHARS} characters"),
        ));
    }
    let contracts = state
        .store
        .search_contracts(auth.user_id(), needle, page)
        .await?;
    Ok(Json(contracts.into_iter().map(without_text).collect()))
}

pub async fn get_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<i64>,
) -> ApiResult<Json<Contract>> {
    let auth = require_auth(&state, &headers).await?;
    let contract = load_contract(&state, &auth, contract_id).await?;
    Ok(Json(contract))
}

pub async fn delete_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<i64>,
) -> ApiResult<StatusCode> {
    let auth = require_auth(&state, &headers).await?;
    load_contract(&state, &auth, contract_id).await?;
    if !state.store.delete_contract(contract_id).await? {
        return Err(ApiError::not_found("contract not found"));
    }
    tracing::info!(contract_id, user_id = auth.user_id(), "contract deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Loads a contract the caller owns or administers.
pub(crate) async fn load_contract(
    state: &AppState,
    auth: &AuthContext,
    contract_id: i64,
) -> ApiResult<Contract> {
    let contract = state
        .store
        .find_contract(contract_id)
        .await?
        .ok_or_else(|| ApiError::not_found("contract not found"))?;
    auth.ensure_can_access(contract.user_id)?;
    Ok(contract)
}

fn without_text(mut contract: Contract) -> Contract {
    contract.extracted_text = None;
    contract
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> StoragePolicy {
        StoragePolicy::new(&["https://files.example.com"]).expect("storage policy")
    }

    fn file<'a>(mime_type: &'a str, file_size: i64) -> UploadedFile<'a> {
        UploadedFile {
            filename: "lease.pdf",
            storage_key: "contracts/1/lease.pdf",
            storage_url: "https://files.example.com/contracts/1/lease.pdf",
            file_size,
            mime_type,
        }
    }

    #[test]
    fn accepts_supported_upload() {
        assert!(validate_upload(&file("application/pdf", 2 * 1024 * 1024), &storage()).is_ok());
        assert!(validate_upload(&file("text/plain", 1), &storage()).is_ok());
    }

    #[test]
    fn rejects_size_outside_bounds() {
        assert!(validate_upload(&file("application/pdf", 0), &storage()).is_err());
        assert!(validate_upload(&file("application/pdf", 10 * 1024 * 1024 + 1), &storage()).is_err());
    }

    #[test]
    fn rejects_unknown_type_and_bad_url() {
        assert!(validate_upload(&file("image/png", 10), &storage()).is_err());

        let mut bad_url = file("application/pdf", 10);
        bad_url.storage_url = "ftp://files.example.com/x";
        assert!(validate_upload(&bad_url, &storage()).is_err());

        let mut internal = file("text/plain", 10);
        internal.storage_url = "http://169.254.169.254/latest/meta-data/iam/security-credentials/";
        assert!(validate_upload(&internal, &storage()).is_err());

        let mut other_host = file("application/pdf", 10);
        other_host.storage_url = "https://attacker.example.net/lease.pdf";
        assert!(validate_upload(&other_host, &storage()).is_err());

        let mut long_name = file("application/pdf", 10);
        let name = "n".repeat(501);
        long_name.filename = &name;
        assert!(validate_upload(&long_name, &storage()).is_err());
    }
}
