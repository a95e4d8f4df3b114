use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct KeywordsRequest {
    #[serde(default)]
    keywords: Vec<String>,
}

/// GET /api/notification/suppress_keywords — the manually curated list
/// only; compiled feedback rules are a separate mechanism.
pub async fn get_suppress_keywords(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let keywords = state.store.list_suppress_keywords().await?;
    Ok(Json(json!({"keywords": keywords})))
}

/// POST /api/notification/suppress_keywords — full replacement.
pub async fn update_suppress_keywords(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<KeywordsRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut cleaned: Vec<String> = Vec::new();
    for keyword in payload.keywords {
        let trimmed = keyword.trim().to_string();
        if !trimmed.is_empty() && !cleaned.contains(&trimmed) {
            cleaned.push(trimmed);
        }
    }
    state.store.replace_suppress_keywords(&cleaned).await?;
    Ok(Json(json!({"success": true, "keywords": cleaned})))
}
