use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use cm_core::model::{Page, RumMetric};
use cm_core::store::TelemetryRepository;
use serde::Deserialize;

use crate::auth::require_admin;
use crate::{ApiResult, AppState};

const MAX_RUM_PAGE: i64 = 1_000;

#[derive(Deserialize)]
pub struct RumQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_rum_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RumQuery>,
) -> ApiResult<Json<Vec<RumMetric>>> {
    require_admin(&state, &headers).await?;
    let page = Page::with_max(query.limit, query.offset, MAX_RUM_PAGE)?;
    Ok(Json(state.store.list_rum_metrics(page).await?))
}
