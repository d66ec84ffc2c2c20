use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use permit_core::model::{
    Application, ApplicationFilter, ApplicationListing, ApplicationStatus, Document, PageRequest,
    DEFAULT_PAGE_SIZE,
};
use permit_core::rbac::Permission;
use permit_core::validation::SubmissionInput;
use permit_core::workflow::{AttemptOutcome, SideEffectAttempt, Submitted, TransitionOptions};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Actor;
use crate::authz;
use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::state::AppState;

/// Citizen submission needs no account.
pub fn public_router() -> Router<AppState> {
    Router::new().route("/applications", post(submit))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/applications", get(list))
        .route("/applications/{id}", get(show).delete(remove))
        .route("/applications/{id}/status", patch(update_status))
}

async fn submit(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<SubmissionInput>,
) -> Result<Json<Submitted>, ApiError> {
    let submitted = state.workflow.submit(&input).await?;
    state.metrics.inc_submission();
    Ok(Json(submitted))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    pub email: Option<String>,
    pub status: Option<String>,
    pub q: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListQuery {
    pub(crate) fn status(&self) -> Result<Option<ApplicationStatus>, ApiError> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => Ok(None),
            Some(raw) => raw
                .parse::<ApplicationStatus>()
                .map(Some)
                .map_err(|e| ApiError::BadRequest(e.to_string())),
        }
    }

    pub(crate) fn page(&self, default_size: u32) -> PageRequest {
        PageRequest::new(
            self.page.unwrap_or(1),
            self.page_size.unwrap_or(default_size),
        )
    }
}

#[derive(Debug, Serialize)]
struct ListResponse {
    applications: Vec<ApplicationListing>,
    total: u64,
    page: u32,
    page_size: u32,
}

async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let filter = ApplicationFilter {
        status: query.status()?,
        search: query.q.clone(),
        applicant_email: authz::scoped_email(&actor, query.email.clone())
            .map(|e| e.trim().to_lowercase()),
    };
    let page = state
        .store
        .list_applications(&filter, query.page(DEFAULT_PAGE_SIZE))
        .await?;

    Ok(Json(ListResponse {
        applications: page.items,
        total: page.total,
        page: page.page,
        page_size: page.page_size,
    }))
}

#[derive(Debug, Serialize)]
struct ApplicationDetail {
    #[serde(flatten)]
    application: Application,
    documents: Vec<Document>,
}

async fn show(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<ApplicationDetail>, ApiError> {
    let application = state
        .store
        .get_application(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let owner = state.store.get_applicant(application.applicant_id).await?;
    authz::require_owner_or(&state, &actor, owner.as_ref(), Permission::ViewAllApplications)
        .await?;

    let documents = state.store.list_documents(id).await?;
    Ok(Json(ApplicationDetail {
        application,
        documents,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    #[serde(default)]
    status: String,
    #[serde(flatten)]
    options: TransitionOptions,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
    id: Uuid,
    status: ApplicationStatus,
    previous_status: ApplicationStatus,
    side_effects: Vec<SideEffectAttempt>,
}

async fn update_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    JsonBody(req): JsonBody<StatusRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    authz::require_permission(&state, &actor, Permission::EditAllApplications).await?;

    let outcome = state.workflow.transition(id, &req.status, req.options).await?;
    state.metrics.inc_transition(1);
    for attempt in &outcome.side_effects {
        state
            .metrics
            .inc_sms(matches!(attempt.outcome, AttemptOutcome::Delivered));
    }

    tracing::info!(
        application_id = %id,
        actor = %actor.email,
        status = %outcome.status,
        "status updated"
    );
    Ok(Json(StatusResponse {
        ok: true,
        id: outcome.id,
        status: outcome.status,
        previous_status: outcome.previous_status,
        side_effects: outcome.side_effects,
    }))
}

async fn remove(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authz::require_permission(&state, &actor, Permission::DeleteAllApplications).await?;

    if state.store.has_payment(id).await? {
        return Err(ApiError::Conflict(
            "application has a payment record and cannot be deleted".to_string(),
        ));
    }
    if !state.store.delete_application(id).await? {
        return Err(ApiError::NotFound);
    }

    tracing::info!(application_id = %id, actor = %actor.email, "application deleted");
    Ok(Json(serde_json::json!({ "ok": true, "id": id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_status_parsing() {
        let query = ListQuery {
            status: Some("all".to_string()),
            ..ListQuery::default()
        };
        assert_eq!(query.status().unwrap(), None);

        let query = ListQuery {
            status: Some("under_review".to_string()),
            ..ListQuery::default()
        };
        assert_eq!(query.status().unwrap(), Some(ApplicationStatus::UnderReview));

        let query = ListQuery {
            status: Some("lost".to_string()),
            ..ListQuery::default()
        };
        assert!(matches!(query.status(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn list_query_page_is_clamped() {
        let query = ListQuery {
            page: Some(0),
            page_size: Some(1000),
            ..ListQuery::default()
        };
        let page = query.page(DEFAULT_PAGE_SIZE);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, permit_core::model::MAX_PAGE_SIZE);
    }
}
