use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use permit_core::store::RoleStore;
use serde::Serialize;

use crate::state::AppState;

/// Identity looked up by the auth check; never assigned a role.
const AUTH_CHECK_IDENTITY: &str = "health-check@localhost";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthChecks {
    pub database: bool,
    pub auth: bool,
    pub storage: bool,
}

impl HealthChecks {
    pub fn status(&self) -> HealthStatus {
        let results = [self.database, self.auth, self.storage];
        if results.iter().all(|ok| *ok) {
            HealthStatus::Healthy
        } else if results.iter().any(|ok| *ok) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: HealthStatus,
    timestamp: chrono::DateTime<chrono::Utc>,
    version: &'static str,
    uptime_secs: u64,
    response_time_ms: u64,
    checks: HealthChecks,
}

/// Single keyed lookup, so the cost does not grow with the role table.
async fn auth_check(roles: &dyn RoleStore) -> bool {
    match roles.role_for(AUTH_CHECK_IDENTITY).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "role store check failed");
            false
        }
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();

    let (database, auth, storage) = tokio::join!(
        state.store.ping(),
        auth_check(state.roles.as_ref()),
        state.documents.check(),
    );
    let checks = HealthChecks {
        database: database.is_ok(),
        auth,
        storage,
    };
    let status = checks.status();
    if status != HealthStatus::Healthy {
        tracing::warn!(?checks, "health check failed");
    }

    let report = HealthReport {
        status,
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        response_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        checks,
    };
    let code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded | HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render(state.started_at.elapsed().as_secs());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use permit_core::rbac::Role;
    use permit_core::store::{Result as StoreResult, StoreError, UserRoleRecord};

    /// Answers keyed lookups but refuses to enumerate.
    struct KeyedOnlyRoles;

    #[async_trait::async_trait]
    impl RoleStore for KeyedOnlyRoles {
        async fn role_for(&self, _user_id: &str) -> StoreResult<Option<Role>> {
            Ok(None)
        }

        async fn upsert_role(&self, _user_id: &str, _role: Role) -> StoreResult<()> {
            Ok(())
        }

        async fn list_roles(&self) -> StoreResult<Vec<UserRoleRecord>> {
            Err(StoreError::Unavailable("full scan".to_string()))
        }
    }

    #[tokio::test]
    async fn auth_check_uses_a_keyed_lookup() {
        assert!(auth_check(&KeyedOnlyRoles).await);

        let down = permit_core::store::memory::MemoryStore::new();
        down.set_available(false);
        assert!(!auth_check(&down).await);
    }

    #[test]
    fn overall_status_from_checks() {
        let all = HealthChecks {
            database: true,
            auth: true,
            storage: true,
        };
        assert_eq!(all.status(), HealthStatus::Healthy);

        let some = HealthChecks {
            storage: false,
            ..all
        };
        assert_eq!(some.status(), HealthStatus::Degraded);

        let none = HealthChecks {
            database: false,
            auth: false,
            storage: false,
        };
        assert_eq!(none.status(), HealthStatus::Unhealthy);
    }
}
