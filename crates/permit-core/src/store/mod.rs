//! Persistence seams for application records and role assignments.
//!
//! The HTTP service backs these with PostgreSQL; [`memory::MemoryStore`] is a
//! process-local implementation with the same semantics.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{
    Applicant, Application, ApplicationFilter, ApplicationListing, ApplicationStatus, ChangeEvent,
    Document, NewApplicant, NewApplicationRecord, NewDocument, NewPayment, Page, PageRequest,
    Payment, StatusCounts,
};
use crate::rbac::Role;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Applicants, applications, documents and payments.
///
/// Status writes are last-write-wins; no method takes a concurrency token.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Insert or update the applicant with this email.
    async fn upsert_applicant(&self, applicant: NewApplicant) -> Result<Applicant>;
    async fn get_applicant(&self, id: Uuid) -> Result<Option<Applicant>>;
    async fn find_applicant_by_email(&self, email: &str) -> Result<Option<Applicant>>;

    /// Insert with status `submitted`.
    async fn insert_application(&self, record: NewApplicationRecord) -> Result<Application>;
    async fn get_application(&self, id: Uuid) -> Result<Option<Application>>;
    /// Newest first.
    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: PageRequest,
    ) -> Result<Page<ApplicationListing>>;
    async fn status_counts(&self) -> Result<StatusCounts>;

    /// Returns the row after the write, or `None` when the id is unknown.
    async fn update_status(&self, id: Uuid, status: ApplicationStatus)
        -> Result<Option<Application>>;
    /// Current status of each known id; unknown ids are absent.
    async fn statuses_of(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, ApplicationStatus>>;
    /// One set-based write; returns the ids that were updated.
    async fn set_status_many(&self, ids: &[Uuid], status: ApplicationStatus) -> Result<Vec<Uuid>>;
    /// One multi-row write restoring each id to its own status; returns restored ids.
    async fn restore_statuses(&self, prior: &[(Uuid, ApplicationStatus)]) -> Result<Vec<Uuid>>;
    async fn delete_application(&self, id: Uuid) -> Result<bool>;

    async fn insert_document(&self, document: NewDocument) -> Result<Document>;
    async fn list_documents(&self, application_id: Uuid) -> Result<Vec<Document>>;

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment>;
    async fn has_payment(&self, application_id: Uuid) -> Result<bool>;
    /// Mark the payment with this provider reference as paid.
    async fn mark_payment_paid(&self, external_ref: &str) -> Result<Option<Payment>>;

    /// Subscribe to row-level changes on applications.
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRoleRecord {
    pub user_id: String,
    pub role: Role,
}

/// Role assignments, at most one row per `user_id`.
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn role_for(&self, user_id: &str) -> Result<Option<Role>>;
    async fn upsert_role(&self, user_id: &str, role: Role) -> Result<()>;
    async fn list_roles(&self) -> Result<Vec<UserRoleRecord>>;
}
