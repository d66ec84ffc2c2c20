//! Staff dashboard: paged listing, live stream and bulk status changes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use permit_core::bulk::{RecordResult, UndoOutcome};
use permit_core::model::{ApplicationFilter, ApplicationListing, ApplicationStatus, StatusCounts};
use permit_core::rbac::Permission;
use permit_core::sync::{SyncConfig, SyncLoop};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::auth::Actor;
use crate::authz;
use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::routes::applications::ListQuery;
use crate::state::AppState;

const STREAM_BUFFER: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/applications", get(dashboard))
        .route("/admin/applications/stream", get(dashboard_stream))
        .route("/admin/applications/bulk-status", post(bulk_status))
        .route(
            "/admin/applications/bulk-status/undo/{token}",
            post(undo_bulk_status),
        )
}

fn filter_from(query: &ListQuery) -> Result<ApplicationFilter, ApiError> {
    Ok(ApplicationFilter {
        status: query.status()?,
        search: query.q.clone(),
        applicant_email: query.email.clone().map(|e| e.trim().to_lowercase()),
    })
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    items: Vec<ApplicationListing>,
    total: u64,
    page: u32,
    page_size: u32,
    total_pages: u64,
    stats: StatusCounts,
}

async fn dashboard(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DashboardResponse>, ApiError> {
    let filter = filter_from(&query)?;
    let page = state
        .store
        .list_applications(&filter, query.page(state.config.dashboard_page_size))
        .await?;
    let stats = state.store.status_counts().await?;

    Ok(Json(DashboardResponse {
        total_pages: page.total_pages(),
        items: page.items,
        total: page.total,
        page: page.page,
        page_size: page.page_size,
        stats,
    }))
}

/// Server-sent events: `view` carries the reloaded page, `notification` a
/// short message per relevant change.
async fn dashboard_stream(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let config = SyncConfig {
        filter: filter_from(&query)?,
        page: query.page(state.config.dashboard_page_size),
        poll_interval: state.config.dashboard_poll_interval,
    };
    let mut handle = SyncLoop::spawn(
        Arc::clone(&state.store),
        state.store.subscribe_changes(),
        config,
    );

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(STREAM_BUFFER);
    let metrics = Arc::clone(&state.metrics);
    metrics.stream_opened();
    tracing::info!(actor = %actor.email, "dashboard stream opened");

    tokio::spawn(async move {
        let mut view = handle.view();
        loop {
            let event = tokio::select! {
                changed = view.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = view.borrow_and_update().clone();
                    Event::default().event("view").json_data(&snapshot)
                }
                Some(notification) = handle.notifications().recv() => {
                    Event::default().event("notification").json_data(&notification)
                }
                _ = tx.closed() => break,
            };

            match event {
                Ok(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode dashboard event"),
            }
        }

        metrics.stream_closed();
        handle.shutdown().await;
        tracing::debug!("dashboard stream closed");
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    #[serde(default)]
    ids: Vec<Uuid>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Serialize)]
struct BulkResponse {
    status: ApplicationStatus,
    updated_count: usize,
    outcomes: Vec<RecordResult>,
    /// Absent when nothing was captured to restore.
    undo_token: Option<String>,
}

async fn bulk_status(
    State(state): State<AppState>,
    actor: Actor,
    JsonBody(req): JsonBody<BulkRequest>,
) -> Result<Json<BulkResponse>, ApiError> {
    authz::require_permission(&state, &actor, Permission::EditAllApplications).await?;

    let outcome = state.bulk.bulk_transition(&req.ids, &req.status).await?;
    state.metrics.inc_bulk_update();
    state
        .metrics
        .inc_transition(u64::try_from(outcome.updated_count).unwrap_or(u64::MAX));

    let undo_token = (!outcome.undo.is_empty()).then(|| state.undo.register(outcome.undo));
    tracing::info!(
        actor = %actor.email,
        status = %outcome.status,
        updated = outcome.updated_count,
        "bulk status update"
    );

    Ok(Json(BulkResponse {
        status: outcome.status,
        updated_count: outcome.updated_count,
        outcomes: outcome.outcomes,
        undo_token,
    }))
}

async fn undo_bulk_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(token): Path<String>,
) -> Result<Json<UndoOutcome>, ApiError> {
    authz::require_permission(&state, &actor, Permission::EditAllApplications).await?;

    let action = state.undo.take(&token).ok_or(ApiError::NotFound)?;
    let outcome = state.bulk.undo(&action).await?;
    tracing::info!(
        actor = %actor.email,
        restored = outcome.restored_count,
        "bulk status update undone"
    );
    Ok(Json(outcome))
}
