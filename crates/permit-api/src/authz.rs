//! Authorization helpers for permit-api endpoints.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use permit_core::model::Applicant;
use permit_core::rbac::{can_view_route, Permission, ResolvedPermissions};

use crate::auth::Actor;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn require_permission(
    state: &AppState,
    actor: &Actor,
    permission: Permission,
) -> Result<ResolvedPermissions, ApiError> {
    Ok(state.guard.require(&actor.email, permission).await?)
}

/// Allow the applicant who owns the record, or anyone holding `permission`.
pub async fn require_owner_or(
    state: &AppState,
    actor: &Actor,
    owner: Option<&Applicant>,
    permission: Permission,
) -> Result<(), ApiError> {
    let is_owner = owner.is_some_and(|a| a.email.eq_ignore_ascii_case(&actor.email));
    if is_owner {
        return Ok(());
    }
    require_permission(state, actor, permission).await.map(|_| ())
}

/// Route-visibility gate for the `/admin` surface.
pub async fn require_route_visibility(request: Request, next: Next) -> Result<Response, ApiError> {
    let actor = request
        .extensions()
        .get::<Actor>()
        .ok_or(ApiError::Unauthorized)?;

    if !can_view_route(request.uri().path(), &actor.permissions) {
        tracing::info!(
            identity = %actor.email,
            path = %request.uri().path(),
            "admin route hidden from caller"
        );
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}

/// Staff may list everything; other callers only see their own applications.
pub fn scoped_email(actor: &Actor, requested: Option<String>) -> Option<String> {
    if actor.permissions.has_permission(Permission::ViewAllApplications) {
        requested
    } else {
        Some(actor.email.clone())
    }
}
