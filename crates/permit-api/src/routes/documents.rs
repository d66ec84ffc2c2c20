use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use permit_core::model::{Document, NewDocument};
use permit_core::rbac::Permission;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::Actor;
use crate::authz;
use crate::error::ApiError;
use crate::extract::JsonBody;
use crate::services::documents::{DocumentError, MAX_DOCUMENT_BYTES};
use crate::state::AppState;

const DEFAULT_KIND: &str = "attachment";

/// Largest upload body: a base64-encoded maximum-size file plus JSON framing.
pub const MAX_UPLOAD_BODY_BYTES: usize = MAX_DOCUMENT_BYTES * 4 / 3 + 64 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/applications/{id}/documents",
            get(list_documents).post(upload_document),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES))
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    #[serde(default)]
    kind: Option<String>,
    file_name: String,
    content_base64: String,
}

impl From<DocumentError> for ApiError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Io(e) => ApiError::Internal(e.to_string()),
            other => ApiError::Validation(other.to_string()),
        }
    }
}

async fn upload_document(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    JsonBody(req): JsonBody<UploadRequest>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let application = state
        .store
        .get_application(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let owner = state.store.get_applicant(application.applicant_id).await?;
    authz::require_owner_or(&state, &actor, owner.as_ref(), Permission::EditAllApplications)
        .await?;

    // Tolerate data-URL prefixes from browser file readers.
    let encoded = req
        .content_base64
        .split_once("base64,")
        .map_or(req.content_base64.as_str(), |(_, data)| data);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::Validation("content_base64: invalid base64".to_string()))?;

    let file_path = state.documents.save(id, &req.file_name, &bytes).await?;
    let kind = req
        .kind
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .unwrap_or(DEFAULT_KIND)
        .to_string();

    let document = state
        .store
        .insert_document(NewDocument {
            application_id: id,
            kind,
            file_path,
            uploaded_by: Some(actor.email.clone()),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn list_documents(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let application = state
        .store
        .get_application(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let owner = state.store.get_applicant(application.applicant_id).await?;
    authz::require_owner_or(&state, &actor, owner.as_ref(), Permission::ViewAllApplications)
        .await?;

    Ok(Json(state.store.list_documents(id).await?))
}
