use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Json;
use chrono::{DateTime, Duration, Local, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use medsignal_common::Severity;

use crate::error::ApiError;
use crate::state::AppState;

use super::parse_date_bound;

#[derive(Deserialize)]
pub struct StatsQuery {
    range: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn range_bounds(params: &StatsQuery) -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    let explicit_start = params
        .start_date
        .as_deref()
        .and_then(|d| parse_date_bound(d, false));
    let explicit_end = params
        .end_date
        .as_deref()
        .and_then(|d| parse_date_bound(d, true));
    if explicit_start.is_some() || explicit_end.is_some() {
        return (
            explicit_start.unwrap_or(now - Duration::days(365)),
            explicit_end.unwrap_or(now),
        );
    }
    let start = match params.range.as_deref() {
        Some("24h") => now - Duration::hours(24),
        Some("30d") => now - Duration::days(30),
        _ => now - Duration::days(7),
    };
    (start, now)
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = range_bounds(&params);
    let summary = state.store.stats(from, to).await?;

    Ok(Json(json!({
        "active_total": summary.active_total,
        "dismissed_total": summary.dismissed_total,
        "high_total": summary.high_total,
        "avg_score": summary.avg_score,
        "severity": {
            "high": summary.high_total,
            "medium": summary.medium_total,
            "low": summary.low_total,
        },
        "sources": summary
            .sources
            .iter()
            .map(|(source, count)| json!({"source": source, "count": count}))
            .collect::<Vec<_>>(),
        "hospital_list": summary.hospital_list,
        "hospitals": summary.hospitals,
    })))
}

pub async fn get_trend(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let range = params.range.as_deref().unwrap_or("7d").to_string();
    let (from, to) = range_bounds(&params);
    let rows = state.store.trend_rows(from, to).await?;
    let data = bucket_trend(&range, from, to, &rows);
    Ok(Json(json!({"range": range, "data": data})))
}

/// Bucket (processed_at, severity) rows into labelled trend points.
/// 24h → hourly buckets labelled HH:00; otherwise daily MM-DD. Labels use
/// the server's local zone; empty buckets are pre-filled.
fn bucket_trend(
    range: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    rows: &[(DateTime<Utc>, String)],
) -> Vec<Value> {
    let hourly = range == "24h";
    let (step, fmt) = if hourly {
        (Duration::hours(1), "%H:00")
    } else {
        (Duration::days(1), "%m-%d")
    };

    let mut buckets: BTreeMap<String, (i64, f64)> = BTreeMap::new();
    let mut cursor = from;
    while cursor <= to {
        buckets
            .entry(cursor.with_timezone(&Local).format(fmt).to_string())
            .or_insert((0, 0.0));
        cursor += step;
    }

    for (processed_at, severity) in rows {
        let label = processed_at.with_timezone(&Local).format(fmt).to_string();
        let entry = buckets.entry(label).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += Severity::parse(severity).score();
    }

    buckets
        .into_iter()
        .map(|(label, (count, score))| {
            let avg = if count > 0 {
                (score / count as f64 * 100.0).round() as i64
            } else {
                0
            };
            json!({"label": label, "count": count, "avgScore": avg})
        })
        .collect()
}
