use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use cm_core::model::ServiceConfigRecord;
use cm_core::service_config::KNOWN_SERVICES;
use cm_core::store::{ServiceConfigRepository, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::require_admin;
use crate::{ApiError, ApiResult, AppState};

/// A known service and its stored config, if any. Services without a row
/// run on built-in defaults.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service: String,
    pub version: i64,
    pub config_json: Option<Value>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServiceConfigRequest {
    pub config_json: Value,
    pub expected_version: Option<i64>,
}

#[allow(clippy::result_large_err)]
fn known_service(service: &str) -> ApiResult<&'static str> {
    KNOWN_SERVICES
        .iter()
        .copied()
        .find(|known| *known == service)
        .ok_or_else(|| ApiError::not_found("service not found"))
}

pub async fn list_services(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ServiceInfo>>> {
    require_admin(&state, &headers).await?;
    let mut records = state.store.list_service_configs().await?;

    let services = KNOWN_SERVICES
        .iter()
        .map(|service| {
            match records.iter().position(|record| record.service == *service) {
                Some(index) => {
                    let record = records.swap_remove(index);
                    ServiceInfo {
                        service: record.service,
                        version: record.version,
                        config_json: Some(record.config_json),
                        updated_at: Some(record.updated_at),
                        updated_by: Some(record.updated_by),
                    }
                }
                None => ServiceInfo {
                    service: service.to_string(),
                    version: 0,
                    config_json: None,
                    updated_at: None,
                    updated_by: None,
                },
            }
        })
        .collect();
    Ok(Json(services))
}

pub async fn get_service_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(service): Path<String>,
) -> ApiResult<Json<ServiceConfigRecord>> {
    require_admin(&state, &headers).await?;
    let service = known_service(&service)?;
    let record = state
        .store
        .load_service_config(service)
        .await?
        .ok_or_else(|| ApiError::not_found("service config not set"))?;
    Ok(Json(record))
}

pub async fn update_service_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(service): Path<String>,
    Json(payload): Json<UpdateServiceConfigRequest>,
) -> ApiResult<Json<ServiceConfigRecord>> {
    let admin = require_admin(&state, &headers).await?;
    let service = known_service(&service)?;
    if !payload.config_json.is_object() {
        return Err(ApiError::bad_request("configJson must be a JSON object"));
    }

    let audit = admin.audit(
        "service_config_updated",
        "service_config",
        service,
        Some(json!({
            "expectedVersion": payload.expected_version,
            "config": payload.config_json.clone(),
        })),
    );
    let record = state
        .store
        .put_service_config(
            service,
            payload.config_json,
            payload.expected_version,
            &admin.user.email,
            Some(audit),
        )
        .await
        .map_err(|err| match err {
            StoreError::Conflict(message) => {
                ApiError::new(StatusCode::CONFLICT, "VERSION_MISMATCH", message)
                    .with_details(json!({ "expectedVersion": payload.expected_version }))
            }
            other => other.into(),
        })?;
    tracing::info!(
        service,
        version = record.version,
        admin_user_id = admin.user_id(),
        "service config updated"
    );
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_known_services_are_addressable() {
        assert_eq!(known_service("analysis").ok(), Some("analysis"));
        assert!(known_service("relay").is_err());
    }
}
