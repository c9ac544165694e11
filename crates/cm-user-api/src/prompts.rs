use axum::extract::{Query, State};
use axum::Json;
use cm_core::model::PromptTemplate;
use cm_core::store::CatalogRepository;
use serde::Deserialize;

use crate::{ApiError, ApiResult, AppState};

#[derive(Deserialize)]
pub struct PromptQuery {
    pub category: Option<String>,
}

pub async fn list_prompts(
    State(state): State<AppState>,
    Query(query): Query<PromptQuery>,
) -> ApiResult<Json<Vec<PromptTemplate>>> {
    let category = query
        .category
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if category.is_some_and(|value| value.len() > 50) {
        return Err(ApiError::bad_request("INVALID_REQUEST", "category is too long"));
    }
    let prompts = state.store.list_prompts(category).await?;
    Ok(Json(prompts))
}
