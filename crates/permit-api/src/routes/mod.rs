pub mod admin;
pub mod applications;
pub mod documents;
pub mod health;
pub mod monitoring;
pub mod notifications;
pub mod payments;
pub mod users;

use axum::{middleware, Router};

use crate::auth;
use crate::authz;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public = Router::new()
        .merge(health::router())
        .merge(applications::public_router())
        .merge(payments::router());

    // Authenticated routes
    let authenticated = Router::new()
        .merge(applications::router())
        .merge(documents::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    // Staff routes; visibility is checked against the full request path.
    let admin = Router::new()
        .merge(admin::router())
        .merge(users::router())
        .merge(monitoring::router())
        .merge(notifications::router())
        .route_layer(middleware::from_fn(authz::require_route_visibility))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(admin)
        .with_state(state)
}
