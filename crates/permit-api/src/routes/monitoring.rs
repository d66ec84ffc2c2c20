use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use permit_core::rbac::Permission;
use serde::Deserialize;

use crate::auth::Actor;
use crate::authz;
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new().route("/admin/monitoring", get(monitoring))
}

#[derive(Debug, Deserialize)]
struct MonitoringQuery {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn monitoring(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<MonitoringQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authz::require_permission(&state, &actor, Permission::PerformanceMonitoring).await?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let data = match query.kind.as_deref().unwrap_or("summary") {
        "summary" => serde_json::to_value(state.metrics.summary()),
        "errors" => serde_json::to_value(state.metrics.recent_errors(limit)),
        other => {
            return Err(ApiError::BadRequest(format!(
                "invalid type {other:?}; expected summary or errors"
            )))
        }
    }
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(serde_json::json!({ "success": true, "data": data })))
}
