use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

use super::format_local;

const SYSTEM_PROMPT: &str = "你是专业的舆情分析助手。";

#[derive(Deserialize)]
pub struct SummaryRequest {
    #[serde(default)]
    opinions: Vec<Value>,
}

#[derive(Deserialize)]
pub struct InsightRequest {
    #[serde(default)]
    opinion: Value,
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("未知")
}

/// POST /api/ai/summary — global briefing over a supplied opinion set.
pub async fn ai_summary(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SummaryRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.opinions.is_empty() {
        return Ok(Json(json!({"text": "暂无负面舆情可总结。"})));
    }

    let lines: Vec<String> = payload
        .opinions
        .iter()
        .enumerate()
        .map(|(idx, op)| {
            let content: String = field(op, "content").chars().take(200).collect();
            format!(
                "{}. 医院:{} 标题:{} 内容:{}",
                idx + 1,
                field(op, "hospital"),
                field(op, "title"),
                content
            )
        })
        .collect();

    let prompt = format!(
        "请基于以下舆情列表生成一段“现状综述”和“公关建议”。\n\
         输出格式：\n现状综述：...\n公关建议：...\n\n舆情列表：\n{}",
        lines.join("\n")
    );

    let text = state
        .llm
        .chat(SYSTEM_PROMPT, &prompt)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "text": text,
        "generated_at": format_local(Utc::now()),
    })))
}

/// POST /api/ai/insight — per-item analysis, cached on the sentiment row.
pub async fn ai_insight(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InsightRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.opinion.is_null() {
        return Err(ApiError::bad_request("missing opinion"));
    }

    let sentiment_id = payload
        .opinion
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(ref id) = sentiment_id {
        if let Some(row) = state.store.find_sentiment(id).await? {
            if let Some(insight) = row.insight_text.filter(|t| !t.is_empty()) {
                return Ok(Json(json!({
                    "text": insight,
                    "generated_at": row.insight_at.map(format_local),
                    "cached": true,
                })));
            }
        }
    }

    let prompt = format!(
        "请对以下单条舆情进行传播风险点分析，并给出简要建议（100字以内）。\n\
         医院:{}\n来源:{}\n标题:{}\n内容:{}\n",
        field(&payload.opinion, "hospital"),
        field(&payload.opinion, "source"),
        field(&payload.opinion, "title"),
        field(&payload.opinion, "content"),
    );

    let text = state
        .llm
        .chat(SYSTEM_PROMPT, &prompt)
        .await
        .map_err(ApiError::internal)?;
    let generated_at = Utc::now();

    if let Some(id) = sentiment_id {
        if let Err(e) = state.store.set_insight(&id, &text, generated_at).await {
            warn!(sentiment_id = %id, error = %e, "Failed to cache insight");
        }
    }

    Ok(Json(json!({
        "text": text,
        "generated_at": format_local(generated_at),
        "cached": false,
    })))
}
