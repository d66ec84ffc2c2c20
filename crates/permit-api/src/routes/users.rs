use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use permit_core::rbac::{Permission, Role};
use permit_core::store::UserRoleRecord;
use serde::{Deserialize, Serialize};

use crate::auth::Actor;
use crate::authz;
use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/users/roles", get(list_roles))
        .route("/admin/users/{user_id}/role", put(assign_role))
}

#[derive(Debug, Serialize)]
struct RoleEntry {
    #[serde(flatten)]
    record: UserRoleRecord,
    display_name: &'static str,
}

async fn list_roles(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<RoleEntry>>, ApiError> {
    authz::require_permission(&state, &actor, Permission::ManageUsers).await?;

    let roles = state
        .role_admin
        .list()
        .await?
        .into_iter()
        .map(|record| RoleEntry {
            display_name: record.role.display_name(),
            record,
        })
        .collect();
    Ok(Json(roles))
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    role: String,
}

async fn assign_role(
    State(state): State<AppState>,
    actor: Actor,
    Path(user_id): Path<String>,
    JsonBody(req): JsonBody<AssignRequest>,
) -> Result<Json<UserRoleRecord>, ApiError> {
    let role = req
        .role
        .trim()
        .parse::<Role>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let record = state
        .role_admin
        .assign(&actor.permissions, &user_id, role)
        .await?;
    Ok(Json(record))
}
