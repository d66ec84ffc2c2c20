pub mod jwt;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use permit_core::rbac::ResolvedPermissions;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller with the permissions resolved for it.
#[derive(Debug, Clone)]
pub struct Actor {
    pub email: String,
    pub permissions: ResolvedPermissions,
}

/// Auth middleware that checks for a JWT bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get("authorization")
        .ok_or(ApiError::Unauthorized)?;
    let header_str = header.to_str().map_err(|_| ApiError::Unauthorized)?;
    let token = header_str
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;

    let claims = jwt::validate_token(token.trim(), &state.config.jwt_secret)?;
    let permissions = state.resolver.resolve(&claims.sub).await;
    request.extensions_mut().insert(Actor {
        email: claims.sub.trim().to_lowercase(),
        permissions,
    });
    Ok(next.run(request).await)
}

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}
