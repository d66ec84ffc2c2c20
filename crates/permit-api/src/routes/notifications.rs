use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use permit_core::notify::{NotifierReceipt, NotifyError};
use permit_core::rbac::Permission;
use permit_core::validation::normalize_phone;
use serde::{Deserialize, Serialize};

use crate::auth::Actor;
use crate::authz;
use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::state::AppState;

const MAX_MESSAGE_CHARS: usize = 480;

pub fn router() -> Router<AppState> {
    Router::new().route("/admin/notifications/sms", post(send_sms))
}

#[derive(Debug, Deserialize)]
struct SmsRequest {
    #[serde(default)]
    to: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct SmsResponse {
    ok: bool,
    receipt: NotifierReceipt,
}

async fn send_sms(
    State(state): State<AppState>,
    actor: Actor,
    JsonBody(req): JsonBody<SmsRequest>,
) -> Result<Json<SmsResponse>, ApiError> {
    authz::require_permission(&state, &actor, Permission::ManageUsers).await?;

    let to = normalize_phone(&req.to);
    let message = req.message.trim();
    if to.is_empty() || message.is_empty() {
        return Err(ApiError::Validation("Missing to or message".to_string()));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::Validation(format!(
            "message: at most {MAX_MESSAGE_CHARS} characters"
        )));
    }

    let result = state.notifier.send(&to, message).await;
    state.metrics.inc_sms(result.is_ok());
    let receipt = result.map_err(|e| match e {
        NotifyError::NotConfigured => ApiError::Unavailable("SMS provider not configured".to_string()),
        other => {
            tracing::warn!(actor = %actor.email, error = %other, "manual sms failed");
            ApiError::Unavailable("SMS provider unavailable".to_string())
        }
    })?;

    tracing::info!(actor = %actor.email, "manual sms sent");
    Ok(Json(SmsResponse { ok: true, receipt }))
}
