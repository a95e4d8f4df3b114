use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use medsignal_common::MedSignalError;
use medsignal_pipeline::feedback::FeedbackSubmission;

use crate::error::ApiError;
use crate::state::AppState;

/// Query/form parameters of the signed feedback link.
#[derive(Deserialize)]
pub struct FeedbackParams {
    queue_id: i64,
    sig: String,
    expires: i64,
    /// "true" = confirmed negative, "false" = false positive.
    judgement: String,
    #[serde(rename = "type", default)]
    feedback_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    user_id: String,
}

/// GET and POST /api/feedback — entry point for the signed link carried
/// in alerts. Expired or mismatched signatures return 401.
pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FeedbackParams>,
) -> Result<Json<Value>, ApiError> {
    let judgement = match params.judgement.as_str() {
        "true" | "1" => true,
        "false" | "0" => false,
        other => {
            return Err(ApiError::bad_request(format!(
                "judgement must be true or false, got {other}"
            )))
        }
    };

    let submission = FeedbackSubmission {
        queue_id: params.queue_id,
        sig: params.sig,
        expires: params.expires,
        judgement,
        feedback_type: params.feedback_type,
        text: params.text,
        user_id: if params.user_id.is_empty() {
            "web".to_string()
        } else {
            params.user_id
        },
    };

    match state
        .feedback
        .on_feedback(state.store.as_ref(), &submission)
        .await
    {
        Ok(()) => Ok(Json(json!({"success": true}))),
        Err(MedSignalError::BadSignature) => {
            Err(ApiError::unauthorized("signature verification failed"))
        }
        Err(MedSignalError::LinkExpired) => Err(ApiError::unauthorized("link expired")),
        Err(e) => Err(ApiError::internal(e.into())),
    }
}
