use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use chrono::{Local, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use medsignal_common::Severity;
use medsignal_store::SentimentRow;

use crate::error::ApiError;
use crate::state::AppState;

use super::{format_local, parse_date_bound};

const FALLBACK_ADVICE: &str =
    "建议：优先处理高危舆情，建立跨部门响应机制，及时澄清事实并跟进患者沟通。";
const TOP_ITEMS: usize = 10;

#[derive(Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    hospital: String,
    #[serde(default)]
    start_date: String,
    #[serde(default)]
    end_date: String,
    #[serde(default)]
    format: String,
    #[serde(default)]
    include_dismissed: bool,
}

/// POST /api/report/generate — render the bundle to data_dir/reports and
/// return the filename for the download endpoint.
pub async fn generate_report(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReportRequest>,
) -> Result<Json<Value>, ApiError> {
    let format = payload.format.to_lowercase();
    let (extension, word_mode) = match format.as_str() {
        "" | "markdown" | "md" => ("md", false),
        "word" | "doc" | "docx" => ("doc", true),
        other => {
            return Err(ApiError::bad_request(format!(
                "unsupported report format: {other}"
            )))
        }
    };

    let hospital = match payload.hospital.as_str() {
        "" | "all" => None,
        name => Some(name),
    };
    let from = parse_date_bound(&payload.start_date, false);
    let to = parse_date_bound(&payload.end_date, true);

    let rows = state
        .store
        .report_rows(hospital, from, to, payload.include_dismissed)
        .await?;

    let advice = build_advice(&state, &rows, hospital).await;
    let hospital_label = hospital.unwrap_or("全院汇总");
    let markdown = render_markdown(
        &rows,
        hospital_label,
        &payload.start_date,
        &payload.end_date,
        &advice,
    );

    let date_label = Local::now().format("%Y%m%d%H%M%S");
    let filename = format!("report_{date_label}.{extension}");
    let content = if word_mode {
        // Word opens HTML documents saved with a .doc extension; the
        // dedicated renderer service owns real .docx output.
        markdown_to_word_html(&markdown)
    } else {
        markdown.clone()
    };

    tokio::fs::create_dir_all(&state.reports_dir)
        .await
        .map_err(|e| ApiError::internal(e.into()))?;
    let path = state.reports_dir.join(&filename);
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| ApiError::internal(e.into()))?;

    info!(filename = %filename, rows = rows.len(), "Report generated");
    Ok(Json(json!({
        "filename": filename,
        "count": rows.len(),
        "generated_at": format_local(Utc::now()),
    })))
}

/// GET /api/report/download/{filename} — stream a rendered report.
pub async fn download_report(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    // Generated names are flat; anything else is a traversal attempt.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ApiError::bad_request("invalid filename"));
    }
    let path = state.reports_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("no report {filename}")))?;

    let content_type = if filename.ends_with(".doc") {
        "application/msword"
    } else {
        "text/markdown; charset=utf-8"
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn build_advice(state: &AppState, rows: &[SentimentRow], hospital: Option<&str>) -> String {
    if rows.is_empty() {
        return "暂无舆情记录，无需出具处置建议。".to_string();
    }
    let lines: Vec<String> = rows
        .iter()
        .take(TOP_ITEMS)
        .enumerate()
        .map(|(idx, row)| {
            let content: String = row.content.chars().take(120).collect();
            format!(
                "{}. 医院:{} 标题:{} 来源:{} 严重程度:{} 内容:{}",
                idx + 1,
                row.hospital,
                row.title,
                row.source,
                row.severity,
                content
            )
        })
        .collect();
    let prompt = format!(
        "请基于以下舆情列表给出一段“处置建议”，控制在300字以内，可使用条目。\n\
         医院范围:{}\n舆情列表：\n{}",
        hospital.unwrap_or("全院汇总"),
        lines.join("\n")
    );
    match state.llm.chat("你是专业的舆情分析助手。", &prompt).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => FALLBACK_ADVICE.to_string(),
        Err(e) => {
            warn!(error = %e, "Advice generation failed, using fallback");
            FALLBACK_ADVICE.to_string()
        }
    }
}

/// Markdown report bundle: executive summary, distributions, daily trend,
/// top items, and the advice section.
fn render_markdown(
    rows: &[SentimentRow],
    hospital: &str,
    start_date: &str,
    end_date: &str,
    advice: &str,
) -> String {
    let total = rows.len();
    let high = rows.iter().filter(|r| r.severity == "high").count();
    let medium = rows.iter().filter(|r| r.severity == "medium").count();
    let low = rows.iter().filter(|r| r.severity == "low").count();
    let avg_score = if total > 0 {
        let sum: f64 = rows.iter().map(|r| Severity::parse(&r.severity).score()).sum();
        (sum / total as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    let mut daily: BTreeMap<String, usize> = BTreeMap::new();
    let mut sources: BTreeMap<String, usize> = BTreeMap::new();
    let mut hospitals: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        let day = row
            .processed_at
            .with_timezone(&Local)
            .format("%m-%d")
            .to_string();
        *daily.entry(day).or_default() += 1;
        let source = if row.source.is_empty() { "未知" } else { &row.source };
        *sources.entry(source.to_string()).or_default() += 1;
        let name = if row.hospital.is_empty() { "未知" } else { &row.hospital };
        *hospitals.entry(name.to_string()).or_default() += 1;
    }

    let mut top: Vec<&SentimentRow> = rows.iter().collect();
    top.sort_by(|a, b| {
        let rank = |r: &SentimentRow| match r.severity.as_str() {
            "high" => 2,
            "medium" => 1,
            _ => 0,
        };
        rank(b)
            .cmp(&rank(a))
            .then_with(|| b.processed_at.cmp(&a.processed_at))
    });
    top.truncate(TOP_ITEMS);

    let mut out = String::new();
    out.push_str("# 舆情监控报告\n\n");
    out.push_str(&format!("- 医院范围：{hospital}\n"));
    out.push_str(&format!(
        "- 统计时间：{} 至 {}\n",
        if start_date.is_empty() { "全部" } else { start_date },
        if end_date.is_empty() { "全部" } else { end_date },
    ));
    out.push_str(&format!(
        "- 生成时间：{}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));

    out.push_str("## 一、执行摘要\n\n");
    out.push_str(&format!("- 舆情总量：{total} 条\n"));
    out.push_str(&format!("- 高危：{high} 条 | 中危：{medium} 条 | 低危：{low} 条\n"));
    out.push_str(&format!("- 平均风险指数：{avg_score}\n\n"));

    out.push_str("## 二、趋势与分布\n\n");
    out.push_str("### 舆情走势\n\n| 日期 | 数量 |\n|---|---|\n");
    for (day, count) in &daily {
        out.push_str(&format!("| {day} | {count} |\n"));
    }
    out.push_str("\n### 来源分布\n\n| 来源 | 数量 |\n|---|---|\n");
    let mut source_rows: Vec<_> = sources.into_iter().collect();
    source_rows.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
    for (source, count) in source_rows {
        out.push_str(&format!("| {source} | {count} |\n"));
    }
    out.push_str("\n### 医院舆情对比\n\n| 医院 | 数量 |\n|---|---|\n");
    let mut hospital_rows: Vec<_> = hospitals.into_iter().collect();
    hospital_rows.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
    for (name, count) in hospital_rows {
        out.push_str(&format!("| {name} | {count} |\n"));
    }

    out.push_str("\n## 三、重点舆情摘要\n\n");
    for (idx, row) in top.iter().enumerate() {
        out.push_str(&format!(
            "{}. **{}**（{} / {}）\n",
            idx + 1,
            row.title,
            row.hospital,
            row.source
        ));
        out.push_str(&format!(
            "   - 严重程度：{}  时间：{}\n",
            row.severity,
            format_local(row.processed_at)
        ));
        out.push_str(&format!("   - 警示理由：{}\n", row.reason));
        if !row.url.is_empty() {
            out.push_str(&format!("   - 原文链接：{}\n", row.url));
        }
    }

    out.push_str("\n## 四、处置建议\n\n");
    out.push_str(advice);
    out.push('\n');
    out
}

/// Minimal Word-compatible HTML wrapper around the markdown body.
/// Titles, reasons, and URLs are scraped free text, so every line is
/// entity-escaped before it lands inside a tag.
fn markdown_to_word_html(markdown: &str) -> String {
    let mut body = String::new();
    for line in markdown.lines() {
        if let Some(h) = line.strip_prefix("# ") {
            body.push_str(&format!("<h1>{}</h1>\n", escape_html(h)));
        } else if let Some(h) = line.strip_prefix("## ") {
            body.push_str(&format!("<h2>{}</h2>\n", escape_html(h)));
        } else if let Some(h) = line.strip_prefix("### ") {
            body.push_str(&format!("<h3>{}</h3>\n", escape_html(h)));
        } else if line.is_empty() {
            body.push_str("<br/>\n");
        } else {
            body.push_str(&format!("<p>{}</p>\n", escape_html(line)));
        }
    }
    format!(
        "<html xmlns:w=\"urn:schemas-microsoft-com:office:word\">\
         <head><meta charset=\"utf-8\"></head><body>{body}</body></html>"
    )
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
