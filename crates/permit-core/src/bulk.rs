//! Bulk status changes with a one-step undo.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{ApplicationStatus, DEFAULT_PAGE_SIZE};
use crate::store::{ApplicationStore, StoreError};

pub const DEFAULT_UNDO_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("no applications selected")]
    EmptySelection,
    #[error("selection of {selected} exceeds the limit of {max}")]
    SelectionTooLarge { selected: usize, max: usize },
    #[error("invalid status: {0:?}")]
    InvalidStatus(String),
    #[error("batch failed: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BulkError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Updated,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub id: Uuid,
    pub outcome: RecordOutcome,
}

#[derive(Clone, Debug)]
pub struct BulkOutcome {
    pub status: ApplicationStatus,
    pub updated_count: usize,
    pub outcomes: Vec<RecordResult>,
    pub undo: UndoAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoOutcome {
    pub restored_count: usize,
    pub outcomes: Vec<RecordResult>,
}

/// Restores every captured application to the status it had before the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoAction {
    prior: Vec<(Uuid, ApplicationStatus)>,
}

impl UndoAction {
    pub fn prior_statuses(&self) -> &[(Uuid, ApplicationStatus)] {
        &self.prior
    }

    pub fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }

    /// Best-effort. A store error fails the call; whatever was already
    /// restored stays restored.
    pub async fn apply(&self, store: &dyn ApplicationStore) -> Result<UndoOutcome> {
        let restored = store.restore_statuses(&self.prior).await?;
        let outcomes = outcomes_for(self.prior.iter().map(|(id, _)| *id), &restored);

        tracing::info!(
            requested = self.prior.len(),
            restored = restored.len(),
            "bulk status change undone"
        );
        Ok(UndoOutcome {
            restored_count: restored.len(),
            outcomes,
        })
    }
}

fn outcomes_for(ids: impl Iterator<Item = Uuid>, updated: &[Uuid]) -> Vec<RecordResult> {
    ids.map(|id| RecordResult {
        id,
        outcome: if updated.contains(&id) {
            RecordOutcome::Updated
        } else {
            RecordOutcome::Missing
        },
    })
    .collect()
}

#[derive(Clone)]
pub struct BulkCoordinator {
    store: Arc<dyn ApplicationStore>,
    max_batch: usize,
}

impl BulkCoordinator {
    pub fn new(store: Arc<dyn ApplicationStore>) -> Self {
        Self {
            store,
            max_batch: DEFAULT_PAGE_SIZE as usize,
        }
    }

    /// Selections are bounded by one dashboard page.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Set every selected application to `target` in one write.
    ///
    /// Prior statuses are captured first so the returned [`UndoAction`] can
    /// put each record back to its own previous status.
    pub async fn bulk_transition(&self, ids: &[Uuid], target: &str) -> Result<BulkOutcome> {
        let ids = dedup(ids);
        if ids.is_empty() {
            return Err(BulkError::EmptySelection);
        }
        if ids.len() > self.max_batch {
            return Err(BulkError::SelectionTooLarge {
                selected: ids.len(),
                max: self.max_batch,
            });
        }
        let status = target
            .trim()
            .parse::<ApplicationStatus>()
            .map_err(|_| BulkError::InvalidStatus(target.to_string()))?;

        let prior: HashMap<Uuid, ApplicationStatus> = self.store.statuses_of(&ids).await?;
        let updated = self.store.set_status_many(&ids, status).await?;

        let undo = UndoAction {
            prior: ids
                .iter()
                .filter_map(|id| prior.get(id).map(|s| (*id, *s)))
                .collect(),
        };
        let outcomes = outcomes_for(ids.iter().copied(), &updated);

        tracing::info!(
            selected = ids.len(),
            updated = updated.len(),
            status = %status,
            "bulk status change applied"
        );
        Ok(BulkOutcome {
            status,
            updated_count: updated.len(),
            outcomes,
            undo,
        })
    }

    pub async fn undo(&self, action: &UndoAction) -> Result<UndoOutcome> {
        action.apply(self.store.as_ref()).await
    }
}

fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Rows selected on the current dashboard page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    ids: BTreeSet<Uuid>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self, id: Uuid) {
        if !self.ids.remove(&id) {
            self.ids.insert(id);
        }
    }

    /// Select every row on the page unless all of them already are, in which
    /// case deselect them.
    pub fn toggle_all_on_page(&mut self, page_ids: &[Uuid]) {
        let all_selected = !page_ids.is_empty() && page_ids.iter().all(|id| self.ids.contains(id));
        if all_selected {
            for id in page_ids {
                self.ids.remove(id);
            }
        } else {
            self.ids.extend(page_ids.iter().copied());
        }
    }

    /// Drop selected ids that are not on the page being shown.
    pub fn retain_page(&mut self, page_ids: &[Uuid]) {
        self.ids.retain(|id| page_ids.contains(id));
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.ids.iter().copied().collect()
    }
}

/// Pending undo actions held between the bulk request and its undo request.
#[derive(Clone)]
pub struct UndoRegistry {
    ttl: Duration,
    inner: Arc<DashMap<String, PendingUndo>>,
}

struct PendingUndo {
    inserted_at: Instant,
    action: UndoAction,
}

impl UndoRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Store `action` and return the token that redeems it.
    pub fn register(&self, action: UndoAction) -> String {
        self.purge_expired();
        let token = Uuid::new_v4().simple().to_string();
        self.inner.insert(
            token.clone(),
            PendingUndo {
                inserted_at: Instant::now(),
                action,
            },
        );
        token
    }

    /// Single use: the entry is removed whether or not it has expired.
    pub fn take(&self, token: &str) -> Option<UndoAction> {
        let (_, pending) = self.inner.remove(token)?;
        (pending.inserted_at.elapsed() < self.ttl).then_some(pending.action)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.inner.retain(|_, p| p.inserted_at.elapsed() < ttl);
    }
}

impl Default for UndoRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApplicationType, NewApplicant, NewApplicationRecord};
    use crate::store::memory::MemoryStore;

    async fn seed(store: &MemoryStore, n: usize) -> Vec<Uuid> {
        let applicant = store
            .upsert_applicant(NewApplicant {
                full_name: "Jane Doe".to_string(),
                phone: "09171234567".to_string(),
                email: "jane@example.com".to_string(),
            })
            .await
            .expect("applicant");
        let mut ids = Vec::new();
        for i in 0..n {
            let app = store
                .insert_application(NewApplicationRecord {
                    applicant_id: applicant.id,
                    application_type: ApplicationType::Building,
                    reference_no: format!("BLD-{i}"),
                    fee_amount: 0.0,
                })
                .await
                .expect("application");
            ids.push(app.id);
        }
        ids
    }

    async fn status(store: &MemoryStore, id: Uuid) -> ApplicationStatus {
        store
            .get_application(id)
            .await
            .expect("get")
            .expect("row")
            .status
    }

    #[tokio::test]
    async fn undo_restores_each_prior_status() {
        let store = MemoryStore::new();
        let ids = seed(&store, 2).await;
        store
            .update_status(ids[0], ApplicationStatus::Submitted)
            .await
            .expect("update");
        store
            .update_status(ids[1], ApplicationStatus::Approved)
            .await
            .expect("update");

        let coordinator = BulkCoordinator::new(Arc::new(store.clone()));
        let outcome = coordinator
            .bulk_transition(&ids, "rejected")
            .await
            .expect("bulk");
        assert_eq!(outcome.updated_count, 2);
        assert_eq!(status(&store, ids[0]).await, ApplicationStatus::Rejected);
        assert_eq!(status(&store, ids[1]).await, ApplicationStatus::Rejected);

        let undone = coordinator.undo(&outcome.undo).await.expect("undo");
        assert_eq!(undone.restored_count, 2);
        assert_eq!(status(&store, ids[0]).await, ApplicationStatus::Submitted);
        assert_eq!(status(&store, ids[1]).await, ApplicationStatus::Approved);
    }

    #[tokio::test]
    async fn missing_records_are_reported_per_id() {
        let store = MemoryStore::new();
        let ids = seed(&store, 1).await;
        let ghost = Uuid::new_v4();

        let coordinator = BulkCoordinator::new(Arc::new(store));
        let outcome = coordinator
            .bulk_transition(&[ids[0], ghost], "approved")
            .await
            .expect("bulk");
        assert_eq!(outcome.updated_count, 1);
        assert_eq!(
            outcome.outcomes,
            vec![
                RecordResult {
                    id: ids[0],
                    outcome: RecordOutcome::Updated
                },
                RecordResult {
                    id: ghost,
                    outcome: RecordOutcome::Missing
                },
            ]
        );
        assert_eq!(outcome.undo.prior_statuses().len(), 1);
    }

    #[tokio::test]
    async fn selection_limits_are_enforced_before_writing() {
        let store = MemoryStore::new();
        let ids = seed(&store, 3).await;
        let coordinator = BulkCoordinator::new(Arc::new(store.clone())).with_max_batch(2);

        assert!(matches!(
            coordinator.bulk_transition(&[], "approved").await,
            Err(BulkError::EmptySelection)
        ));
        assert!(matches!(
            coordinator.bulk_transition(&ids, "approved").await,
            Err(BulkError::SelectionTooLarge { selected: 3, max: 2 })
        ));
        assert!(matches!(
            coordinator.bulk_transition(&ids[..1], "archived").await,
            Err(BulkError::InvalidStatus(_))
        ));
        assert_eq!(status(&store, ids[0]).await, ApplicationStatus::Submitted);
    }

    #[tokio::test]
    async fn store_failure_fails_the_whole_batch() {
        let store = MemoryStore::new();
        let ids = seed(&store, 2).await;
        store.set_available(false);
        let coordinator = BulkCoordinator::new(Arc::new(store));
        assert!(matches!(
            coordinator.bulk_transition(&ids, "approved").await,
            Err(BulkError::Store(_))
        ));
    }

    #[test]
    fn toggle_all_on_page_flips_between_all_and_none() {
        let page: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut selection = Selection::new();

        selection.toggle(page[0]);
        selection.toggle_all_on_page(&page);
        assert_eq!(selection.len(), 3);

        selection.toggle_all_on_page(&page);
        assert!(selection.is_empty());

        selection.toggle(page[1]);
        selection.toggle(page[1]);
        assert!(!selection.contains(&page[1]));

        selection.toggle_all_on_page(&page);
        selection.retain_page(&page[..1]);
        assert_eq!(selection.ids(), vec![page[0]]);
        selection.clear();
        assert!(selection.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undo_tokens_are_single_use_and_expire() {
        let registry = UndoRegistry::new(Duration::from_secs(60));
        let action = UndoAction {
            prior: vec![(Uuid::new_v4(), ApplicationStatus::Approved)],
        };

        let token = registry.register(action.clone());
        assert_eq!(registry.take(&token), Some(action.clone()));
        assert_eq!(registry.take(&token), None);

        let token = registry.register(action);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.take(&token), None);
        assert!(registry.is_empty());
    }
}
