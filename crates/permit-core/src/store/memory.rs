//! Process-local [`ApplicationStore`] and [`RoleStore`] behind one mutex,
//! publishing application changes on a broadcast feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ApplicationStore, Result, RoleStore, StoreError, UserRoleRecord};
use crate::model::{
    Applicant, ApplicantContact, Application, ApplicationFilter, ApplicationListing,
    ApplicationStatus, ChangeEvent, Document, NewApplicant, NewApplicationRecord, NewDocument,
    NewPayment, Page, PageRequest, Payment, PaymentStatus, StatusCounts,
};
use crate::rbac::Role;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Process-local store. Every mutation of an application is published on the
/// change feed, like the database trigger does for PostgreSQL.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    changes: broadcast::Sender<ChangeEvent>,
    available: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemoryInner {
    applicants: HashMap<Uuid, Applicant>,
    applications: HashMap<Uuid, Application>,
    documents: Vec<Document>,
    payments: Vec<Payment>,
    roles: HashMap<String, Role>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            changes,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine.
        let _ = self.changes.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn upsert_applicant(&self, applicant: NewApplicant) -> Result<Applicant> {
        let mut inner = self.lock()?;
        let existing = inner
            .applicants
            .values_mut()
            .find(|a| a.email.eq_ignore_ascii_case(&applicant.email));

        if let Some(row) = existing {
            row.full_name = applicant.full_name;
            row.phone = applicant.phone;
            return Ok(row.clone());
        }

        let row = Applicant {
            id: Uuid::new_v4(),
            full_name: applicant.full_name,
            phone: applicant.phone,
            email: applicant.email,
        };
        inner.applicants.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_applicant(&self, id: Uuid) -> Result<Option<Applicant>> {
        Ok(self.lock()?.applicants.get(&id).cloned())
    }

    async fn find_applicant_by_email(&self, email: &str) -> Result<Option<Applicant>> {
        Ok(self
            .lock()?
            .applicants
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn insert_application(&self, record: NewApplicationRecord) -> Result<Application> {
        let row = {
            let mut inner = self.lock()?;
            if !inner.applicants.contains_key(&record.applicant_id) {
                return Err(StoreError::Conflict(format!(
                    "applicant {} does not exist",
                    record.applicant_id
                )));
            }
            if inner
                .applications
                .values()
                .any(|a| a.reference_no == record.reference_no)
            {
                return Err(StoreError::Conflict(format!(
                    "duplicate reference number {}",
                    record.reference_no
                )));
            }

            let row = Application {
                id: Uuid::new_v4(),
                applicant_id: record.applicant_id,
                application_type: record.application_type,
                status: ApplicationStatus::Submitted,
                reference_no: record.reference_no,
                fee_amount: record.fee_amount,
                created_at: Utc::now(),
            };
            inner.applications.insert(row.id, row.clone());
            row
        };

        self.publish(ChangeEvent::Insert { new: row.clone() });
        Ok(row)
    }

    async fn get_application(&self, id: Uuid) -> Result<Option<Application>> {
        Ok(self.lock()?.applications.get(&id).cloned())
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: PageRequest,
    ) -> Result<Page<ApplicationListing>> {
        let inner = self.lock()?;

        let mut matching: Vec<ApplicationListing> = inner
            .applications
            .values()
            .filter_map(|app| {
                let applicant = inner.applicants.get(&app.applicant_id);
                if !filter.matches(app, applicant.map(|a| a.email.as_str())) {
                    return None;
                }
                Some(ApplicationListing {
                    application: app.clone(),
                    applicant: applicant.map(|a| ApplicantContact {
                        full_name: a.full_name.clone(),
                        email: a.email.clone(),
                        phone: a.phone.clone(),
                    }),
                })
            })
            .collect();

        matching.sort_by(|a, b| {
            b.application
                .created_at
                .cmp(&a.application.created_at)
                .then_with(|| b.application.id.cmp(&a.application.id))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.page_size as usize)
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let inner = self.lock()?;
        let mut counts = StatusCounts::default();
        for app in inner.applications.values() {
            counts.add(app.status, 1);
        }
        Ok(counts)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> Result<Option<Application>> {
        let change = {
            let mut inner = self.lock()?;
            let Some(row) = inner.applications.get_mut(&id) else {
                return Ok(None);
            };
            let old = row.clone();
            row.status = status;
            (old, row.clone())
        };

        let (old, new) = change;
        self.publish(ChangeEvent::Update {
            old,
            new: new.clone(),
        });
        Ok(Some(new))
    }

    async fn statuses_of(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, ApplicationStatus>> {
        let inner = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.applications.get(id).map(|a| (*id, a.status)))
            .collect())
    }

    async fn set_status_many(&self, ids: &[Uuid], status: ApplicationStatus) -> Result<Vec<Uuid>> {
        let prior: Vec<(Uuid, ApplicationStatus)> = ids.iter().map(|id| (*id, status)).collect();
        self.restore_statuses(&prior).await
    }

    async fn restore_statuses(&self, prior: &[(Uuid, ApplicationStatus)]) -> Result<Vec<Uuid>> {
        let mut events = Vec::new();
        let mut updated = Vec::new();
        {
            let mut inner = self.lock()?;
            for (id, status) in prior {
                let Some(row) = inner.applications.get_mut(id) else {
                    continue;
                };
                if updated.contains(id) {
                    continue;
                }
                let old = row.clone();
                row.status = *status;
                events.push(ChangeEvent::Update {
                    old,
                    new: row.clone(),
                });
                updated.push(*id);
            }
        }

        for event in events {
            self.publish(event);
        }
        Ok(updated)
    }

    async fn delete_application(&self, id: Uuid) -> Result<bool> {
        let removed = {
            let mut inner = self.lock()?;
            let removed = inner.applications.remove(&id);
            if removed.is_some() {
                inner.documents.retain(|d| d.application_id != id);
            }
            removed
        };

        match removed {
            Some(old) => {
                self.publish(ChangeEvent::Delete { old });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_document(&self, document: NewDocument) -> Result<Document> {
        let mut inner = self.lock()?;
        if !inner.applications.contains_key(&document.application_id) {
            return Err(StoreError::Conflict(format!(
                "application {} does not exist",
                document.application_id
            )));
        }
        let row = Document {
            id: Uuid::new_v4(),
            application_id: document.application_id,
            kind: document.kind,
            file_path: document.file_path,
            uploaded_by: document.uploaded_by,
            created_at: Utc::now(),
        };
        inner.documents.push(row.clone());
        Ok(row)
    }

    async fn list_documents(&self, application_id: Uuid) -> Result<Vec<Document>> {
        Ok(self
            .lock()?
            .documents
            .iter()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        let mut inner = self.lock()?;
        if !inner.applications.contains_key(&payment.application_id) {
            return Err(StoreError::Conflict(format!(
                "application {} does not exist",
                payment.application_id
            )));
        }
        let row = Payment {
            id: Uuid::new_v4(),
            application_id: payment.application_id,
            amount: payment.amount,
            status: payment.status,
            external_ref: payment.external_ref,
            method: payment.method,
            created_at: Utc::now(),
        };
        inner.payments.push(row.clone());
        Ok(row)
    }

    async fn has_payment(&self, application_id: Uuid) -> Result<bool> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .any(|p| p.application_id == application_id))
    }

    async fn mark_payment_paid(&self, external_ref: &str) -> Result<Option<Payment>> {
        let mut inner = self.lock()?;
        let Some(row) = inner
            .payments
            .iter_mut()
            .find(|p| p.external_ref == external_ref)
        else {
            return Ok(None);
        };
        row.status = PaymentStatus::Paid;
        Ok(Some(row.clone()))
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn role_for(&self, user_id: &str) -> Result<Option<Role>> {
        Ok(self.lock()?.roles.get(user_id).copied())
    }

    async fn upsert_role(&self, user_id: &str, role: Role) -> Result<()> {
        self.lock()?.roles.insert(user_id.to_string(), role);
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<UserRoleRecord>> {
        let inner = self.lock()?;
        let mut out: Vec<UserRoleRecord> = inner
            .roles
            .iter()
            .map(|(user_id, role)| UserRoleRecord {
                user_id: user_id.clone(),
                role: *role,
            })
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationType;

    async fn seed(store: &MemoryStore, email: &str, reference_no: &str) -> Application {
        let applicant = store
            .upsert_applicant(NewApplicant {
                full_name: "Jane Doe".to_string(),
                phone: "09171234567".to_string(),
                email: email.to_string(),
            })
            .await
            .expect("applicant");
        store
            .insert_application(NewApplicationRecord {
                applicant_id: applicant.id,
                application_type: ApplicationType::Business,
                reference_no: reference_no.to_string(),
                fee_amount: 150.0,
            })
            .await
            .expect("application")
    }

    #[tokio::test]
    async fn applicants_are_upserted_by_email() {
        let store = MemoryStore::new();
        let first = store
            .upsert_applicant(NewApplicant {
                full_name: "Jane Doe".to_string(),
                phone: "09171234567".to_string(),
                email: "jane@example.com".to_string(),
            })
            .await
            .expect("insert");
        let second = store
            .upsert_applicant(NewApplicant {
                full_name: "Jane Q. Doe".to_string(),
                phone: "09999999999".to_string(),
                email: "JANE@example.com".to_string(),
            })
            .await
            .expect("update");

        assert_eq!(first.id, second.id);
        assert_eq!(second.full_name, "Jane Q. Doe");
        assert_eq!(second.phone, "09999999999");
    }

    #[tokio::test]
    async fn mutations_are_published_on_the_change_feed() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_changes();

        let app = seed(&store, "jane@example.com", "BUS-1").await;
        store
            .update_status(app.id, ApplicationStatus::Approved)
            .await
            .expect("update");
        assert!(store.delete_application(app.id).await.expect("delete"));

        assert!(matches!(rx.recv().await, Ok(ChangeEvent::Insert { .. })));
        match rx.recv().await {
            Ok(ChangeEvent::Update { old, new }) => {
                assert_eq!(old.status, ApplicationStatus::Submitted);
                assert_eq!(new.status, ApplicationStatus::Approved);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Ok(ChangeEvent::Delete { .. })));
    }

    #[tokio::test]
    async fn listing_filters_by_owner_and_pages_newest_first() {
        let store = MemoryStore::new();
        for i in 0..3 {
            seed(&store, "jane@example.com", &format!("BUS-J{i}")).await;
        }
        seed(&store, "juan@example.com", "BUS-X").await;

        let filter = ApplicationFilter {
            applicant_email: Some("jane@example.com".to_string()),
            ..Default::default()
        };
        let page = store
            .list_applications(&filter, PageRequest::new(1, 2))
            .await
            .expect("list");
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].application.created_at >= page.items[1].application.created_at);
        assert_eq!(
            page.items[0].applicant.as_ref().map(|a| a.email.as_str()),
            Some("jane@example.com")
        );

        let rest = store
            .list_applications(&filter, PageRequest::new(2, 2))
            .await
            .expect("list");
        assert_eq!(rest.items.len(), 1);
    }

    #[tokio::test]
    async fn set_status_many_skips_unknown_ids() {
        let store = MemoryStore::new();
        let app = seed(&store, "jane@example.com", "BUS-1").await;
        let updated = store
            .set_status_many(&[app.id, Uuid::new_v4()], ApplicationStatus::Rejected)
            .await
            .expect("bulk");
        assert_eq!(updated, vec![app.id]);
        let counts = store.status_counts().await.expect("counts");
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.total, 1);
    }

    #[tokio::test]
    async fn payments_are_marked_paid_by_external_ref() {
        let store = MemoryStore::new();
        let app = seed(&store, "jane@example.com", "BUS-1").await;
        store
            .insert_payment(NewPayment {
                application_id: app.id,
                amount: 150.0,
                status: PaymentStatus::Pending,
                external_ref: "inv_123".to_string(),
                method: "gcash".to_string(),
            })
            .await
            .expect("payment");

        assert!(store.has_payment(app.id).await.expect("has"));
        assert!(store.mark_payment_paid("inv_unknown").await.expect("mark").is_none());
        let paid = store
            .mark_payment_paid("inv_123")
            .await
            .expect("mark")
            .expect("payment row");
        assert_eq!(paid.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.role_for("a@b.co").await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
