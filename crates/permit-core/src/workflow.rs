//! Application status workflow.
//!
//! Transitions are persisted last-write-wins; the nominal state graph in
//! [`ApplicationStatus::nominal_successors`] is not enforced. Applicant SMS
//! notifications are best-effort and reported in the outcome's side-effect log,
//! never as the result of the operation itself.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{generate_reference_no, Application, ApplicationStatus, NewApplicationRecord};
use crate::notify::Notifier;
use crate::store::{ApplicationStore, StoreError};
use crate::validation::{NewApplication, SubmissionInput, ValidationErrors};

const REFERENCE_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid status: {0:?}")]
    InvalidStatus(String),
    #[error("application {0} not found")]
    NotFound(Uuid),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TransitionOptions {
    #[serde(default)]
    pub notify: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Sms,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    Skipped(String),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectAttempt {
    pub kind: SideEffectKind,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub id: Uuid,
    pub status: ApplicationStatus,
    pub previous_status: ApplicationStatus,
    pub side_effects: Vec<SideEffectAttempt>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitted {
    pub id: Uuid,
    pub reference_no: String,
}

/// Text of the status SMS; the id is shortened to its first eight characters.
pub fn status_message(id: Uuid, status: ApplicationStatus) -> String {
    let id = id.to_string();
    let short = id.get(..8).unwrap_or(&id);
    format!("Dipolog Permits: Your application {short} status is now {status}.")
}

#[derive(Clone)]
pub struct StatusWorkflow {
    store: Arc<dyn ApplicationStore>,
    notifier: Arc<dyn Notifier>,
}

impl StatusWorkflow {
    pub fn new(store: Arc<dyn ApplicationStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<dyn ApplicationStore> {
        &self.store
    }

    /// Validate a citizen submission, upsert its applicant and create the
    /// application in `submitted`.
    pub async fn submit(&self, input: &SubmissionInput) -> Result<Submitted> {
        let new = input.validate()?;
        self.submit_validated(new).await
    }

    pub async fn submit_validated(&self, new: NewApplication) -> Result<Submitted> {
        let applicant = self.store.upsert_applicant(new.applicant).await?;

        let mut attempt = 0;
        let application = loop {
            attempt += 1;
            let record = NewApplicationRecord {
                applicant_id: applicant.id,
                application_type: new.application_type,
                reference_no: generate_reference_no(new.application_type, Utc::now()),
                fee_amount: new.fee_amount,
            };
            match self.store.insert_application(record).await {
                Ok(app) => break app,
                Err(StoreError::Conflict(reason)) if attempt < REFERENCE_ATTEMPTS => {
                    tracing::warn!(attempt, reason = %reason, "reference number collision; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            application_id = %application.id,
            reference_no = %application.reference_no,
            application_type = %application.application_type,
            "application submitted"
        );
        Ok(Submitted {
            id: application.id,
            reference_no: application.reference_no,
        })
    }

    /// Set the status of one application.
    ///
    /// `target` is parsed before the store is touched; an unknown status
    /// leaves the record unchanged.
    pub async fn transition(
        &self,
        id: Uuid,
        target: &str,
        options: TransitionOptions,
    ) -> Result<TransitionOutcome> {
        let status = target
            .trim()
            .parse::<ApplicationStatus>()
            .map_err(|_| WorkflowError::InvalidStatus(target.to_string()))?;
        self.transition_to(id, status, options).await
    }

    pub async fn transition_to(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        options: TransitionOptions,
    ) -> Result<TransitionOutcome> {
        let current = self
            .store
            .get_application(id)
            .await?
            .ok_or(WorkflowError::NotFound(id))?;

        let updated = self
            .store
            .update_status(id, status)
            .await?
            .ok_or(WorkflowError::NotFound(id))?;

        tracing::info!(
            application_id = %id,
            from = %current.status,
            to = %updated.status,
            "application status changed"
        );

        let mut side_effects = Vec::new();
        if options.notify {
            side_effects.push(self.notify_applicant(&updated).await);
        }

        Ok(TransitionOutcome {
            id,
            status: updated.status,
            previous_status: current.status,
            side_effects,
        })
    }

    /// Payment provider reported `external_ref` as paid.
    ///
    /// The payment row and the application status are two separate writes;
    /// the application always moves to `under_review`, whatever its current
    /// status. Unknown references yield `Ok(None)`.
    pub async fn on_payment_paid(&self, external_ref: &str) -> Result<Option<TransitionOutcome>> {
        let Some(payment) = self.store.mark_payment_paid(external_ref).await? else {
            tracing::warn!(external_ref = %external_ref, "paid notification for unknown payment");
            return Ok(None);
        };

        tracing::info!(
            external_ref = %external_ref,
            application_id = %payment.application_id,
            "payment marked paid"
        );

        let outcome = self
            .transition_to(
                payment.application_id,
                ApplicationStatus::UnderReview,
                TransitionOptions::default(),
            )
            .await?;
        Ok(Some(outcome))
    }

    async fn notify_applicant(&self, application: &Application) -> SideEffectAttempt {
        let outcome = match self.store.get_applicant(application.applicant_id).await {
            Ok(Some(applicant)) if !applicant.phone.trim().is_empty() => {
                let message = status_message(application.id, application.status);
                match self.notifier.send(&applicant.phone, &message).await {
                    Ok(_) => AttemptOutcome::Delivered,
                    Err(e) => {
                        tracing::warn!(application_id = %application.id, error = %e, "status sms failed");
                        AttemptOutcome::Failed(e.to_string())
                    }
                }
            }
            Ok(_) => AttemptOutcome::Skipped("applicant has no phone number".to_string()),
            Err(e) => {
                tracing::warn!(application_id = %application.id, error = %e, "applicant lookup failed");
                AttemptOutcome::Failed(format!("applicant lookup failed: {e}"))
            }
        };

        SideEffectAttempt {
            kind: SideEffectKind::Sms,
            outcome,
        }
    }
}
