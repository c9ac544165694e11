use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use cm_core::model::DashboardStats;
use cm_core::store::AdminRepository;
use serde::Serialize;

use crate::auth::require_admin;
use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub collected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: DashboardStats,
}

pub async fn get_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<DashboardSnapshot>> {
    require_admin(&state, &headers).await?;
    let stats = state.store.dashboard_stats().await?;
    Ok(Json(DashboardSnapshot {
        collected_at: Utc::now(),
        stats,
    }))
}
