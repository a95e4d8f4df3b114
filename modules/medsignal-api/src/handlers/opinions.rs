use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use medsignal_common::Severity;
use medsignal_store::{SentimentFilter, SentimentRow};

use crate::error::ApiError;
use crate::state::AppState;

use super::{format_local, parse_date_bound};

#[derive(Deserialize)]
pub struct OpinionsQuery {
    status: Option<String>,
    hospital: Option<String>,
    severity: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    compact: Option<String>,
    preview: Option<usize>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    query: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    compact: Option<String>,
    preview: Option<usize>,
}

fn is_truthy(raw: Option<&str>) -> bool {
    matches!(raw, Some("1") | Some("true") | Some("yes"))
}

/// JSON shape consumed by the dashboard list and detail views.
pub fn row_to_opinion(row: &SentimentRow, include_content: bool, preview_len: usize) -> Value {
    let (content, truncated) = if include_content {
        (row.content.clone(), false)
    } else {
        let preview: String = row.content.chars().take(preview_len).collect();
        let truncated = row.content.chars().count() > preview_len;
        (preview, truncated)
    };
    json!({
        "id": row.sentiment_id,
        "event_id": row.event_id,
        "hospital": row.hospital,
        "title": row.title,
        "source": row.source,
        "content": content,
        "reason": row.reason,
        "severity": row.severity,
        "score": Severity::parse(&row.severity).score(),
        "url": row.url,
        "status": row.status,
        "is_duplicate": row.is_duplicate,
        "dismissed_at": row.dismissed_at.map(format_local),
        "content_truncated": truncated,
        "createdAt": format_local(row.processed_at),
    })
}

pub async fn list_opinions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OpinionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let compact = is_truthy(params.compact.as_deref());
    let preview = params.preview.unwrap_or(240);

    let filter = SentimentFilter {
        status: Some(params.status.unwrap_or_else(|| "active".to_string())),
        hospital: params.hospital.filter(|h| !h.is_empty()),
        severity: params.severity.filter(|s| !s.is_empty()),
        from: params
            .start_date
            .as_deref()
            .and_then(|d| parse_date_bound(d, false)),
        to: params
            .end_date
            .as_deref()
            .and_then(|d| parse_date_bound(d, true)),
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    };

    let rows = state.store.list_sentiments(&filter).await?;
    let opinions: Vec<Value> = rows
        .iter()
        .map(|r| row_to_opinion(r, !compact, preview))
        .collect();
    Ok(Json(Value::Array(opinions)))
}

pub async fn get_opinion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.store.find_sentiment(&id).await? {
        Some(row) => Ok(Json(row_to_opinion(&row, true, 0))),
        None => Err(ApiError::not_found(format!("no sentiment {id}"))),
    }
}

pub async fn search_opinions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let query = params.query.unwrap_or_default();
    if query.trim().is_empty() {
        return Ok(Json(Value::Array(Vec::new())));
    }
    let compact = is_truthy(params.compact.as_deref());
    let preview = params.preview.unwrap_or(240);

    let rows = state
        .store
        .search_sentiments(
            query.trim(),
            params.limit.unwrap_or(50),
            params.offset.unwrap_or(0),
        )
        .await?;
    let opinions: Vec<Value> = rows
        .iter()
        .map(|r| row_to_opinion(r, !compact, preview))
        .collect();
    Ok(Json(Value::Array(opinions)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(content: &str) -> SentimentRow {
        SentimentRow {
            sentiment_id: "s-1".to_string(),
            event_id: Some(3),
            hospital: "市一医院".to_string(),
            title: "标题".to_string(),
            source: "抖音".to_string(),
            content: content.to_string(),
            reason: "理由".to_string(),
            severity: "high".to_string(),
            url: "https://vendor.example/r?id=1".to_string(),
            status: "active".to_string(),
            is_duplicate: false,
            dismissed_at: None,
            insight_text: None,
            insight_at: None,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn full_content_has_no_truncation_flag() {
        let value = row_to_opinion(&row("很长的内容"), true, 2);
        assert_eq!(value["content"], "很长的内容");
        assert_eq!(value["content_truncated"], false);
        assert_eq!(value["score"], 0.92);
    }

    #[test]
    fn compact_mode_truncates_by_chars() {
        let value = row_to_opinion(&row("一二三四五"), false, 3);
        assert_eq!(value["content"], "一二三");
        assert_eq!(value["content_truncated"], true);
    }

    #[test]
    fn truthy_parsing() {
        assert!(is_truthy(Some("1")));
        assert!(is_truthy(Some("true")));
        assert!(!is_truthy(Some("0")));
        assert!(!is_truthy(None));
    }
}
