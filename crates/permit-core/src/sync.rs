//! Dashboard reconciliation loop.
//!
//! One loop per open dashboard view. It listens to the application change
//! feed, reloads the current page on every change and on a polling tick, and
//! publishes the page snapshot plus short notifications. The last reload wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::model::{
    ApplicationFilter, ApplicationListing, ChangeEvent, PageRequest, StatusCounts,
};
use crate::store::{ApplicationStore, StoreError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("reload failed: {0}")]
    Store(#[from] StoreError),
}

/// One page of the dashboard plus the per-status totals.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DashboardPage {
    pub items: Vec<ApplicationListing>,
    pub total: u64,
    pub stats: StatusCounts,
}

/// Where the loop reloads its page from.
#[async_trait]
pub trait ListSource: Send + Sync {
    async fn load_page(
        &self,
        filter: &ApplicationFilter,
        page: PageRequest,
    ) -> Result<DashboardPage, SyncError>;
}

#[async_trait]
impl<S: ApplicationStore + ?Sized> ListSource for S {
    async fn load_page(
        &self,
        filter: &ApplicationFilter,
        page: PageRequest,
    ) -> Result<DashboardPage, SyncError> {
        let listing = self.list_applications(filter, page).await?;
        let stats = self.status_counts().await?;
        Ok(DashboardPage {
            items: listing.items,
            total: listing.total,
            stats,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DashboardView {
    pub filter: ApplicationFilter,
    pub page: PageRequest,
    pub items: Vec<ApplicationListing>,
    pub total: u64,
    pub stats: StatusCounts,
    /// Inserts seen since the loop started.
    pub new_items: u64,
    pub connected: bool,
    /// Bumped on every successful reload.
    pub revision: u64,
}

impl DashboardView {
    fn empty(filter: ApplicationFilter, page: PageRequest) -> Self {
        Self {
            filter,
            page,
            items: Vec::new(),
            total: 0,
            stats: StatusCounts::default(),
            new_items: 0,
            connected: true,
            revision: 0,
        }
    }

    pub fn total_pages(&self) -> u64 {
        let size = u64::from(self.page.page_size.max(1));
        self.total.div_ceil(size).max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Inserted,
    StatusChanged,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotification {
    pub kind: NotificationKind,
    pub application_id: Uuid,
    pub message: String,
}

/// Notification for a change event, if it warrants one.
pub fn notification_for(event: &ChangeEvent) -> Option<SyncNotification> {
    match event {
        ChangeEvent::Insert { new } => Some(SyncNotification {
            kind: NotificationKind::Inserted,
            application_id: new.id,
            message: format!("New {} application received", new.application_type),
        }),
        ChangeEvent::Update { old, new } if old.status != new.status => Some(SyncNotification {
            kind: NotificationKind::StatusChanged,
            application_id: new.id,
            message: format!(
                "Application {} is now {}",
                new.reference_no,
                new.status.display_name()
            ),
        }),
        ChangeEvent::Update { .. } => None,
        ChangeEvent::Delete { old } => Some(SyncNotification {
            kind: NotificationKind::Removed,
            application_id: old.id,
            message: "An application was removed".to_string(),
        }),
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub filter: ApplicationFilter,
    pub page: PageRequest,
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            filter: ApplicationFilter::default(),
            page: PageRequest::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Owner of a running loop. Dropping it stops the loop.
pub struct SyncHandle {
    view: watch::Receiver<DashboardView>,
    connected: watch::Receiver<bool>,
    notifications: mpsc::Receiver<SyncNotification>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn view(&self) -> watch::Receiver<DashboardView> {
        self.view.clone()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn notifications(&mut self) -> &mut mpsc::Receiver<SyncNotification> {
        &mut self.notifications
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the loop and wait for it to release its subscription.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "dashboard sync task ended abnormally");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub struct SyncLoop<L: ListSource + ?Sized> {
    source: Arc<L>,
    changes: broadcast::Receiver<ChangeEvent>,
    config: SyncConfig,
    view: DashboardView,
    view_tx: watch::Sender<DashboardView>,
    connected_tx: watch::Sender<bool>,
    notify_tx: mpsc::Sender<SyncNotification>,
}

impl<L: ListSource + ?Sized + 'static> SyncLoop<L> {
    /// Start a loop on the current tokio runtime.
    pub fn spawn(
        source: Arc<L>,
        changes: broadcast::Receiver<ChangeEvent>,
        config: SyncConfig,
    ) -> SyncHandle {
        let view = DashboardView::empty(config.filter.clone(), config.page);
        let (view_tx, view_rx) = watch::channel(view.clone());
        let (connected_tx, connected_rx) = watch::channel(true);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let sync = SyncLoop {
            source,
            changes,
            config,
            view,
            view_tx,
            connected_tx,
            notify_tx,
        };
        let task = tokio::spawn(sync.run(shutdown_rx));

        SyncHandle {
            view: view_rx,
            connected: connected_rx,
            notifications: notify_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        self.reload().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut feed_open = true;
        loop {
            tokio::select! {
                biased;
                // A dropped handle also resolves this branch.
                _ = &mut shutdown => break,
                event = self.changes.recv(), if feed_open => match event {
                    Ok(event) => {
                        self.apply(&event);
                        self.reload().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "dashboard change feed lagged; reloading");
                        self.reload().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("dashboard change feed closed");
                        feed_open = false;
                        self.set_connected(false);
                    }
                },
                _ = ticker.tick() => {
                    self.reload().await;
                }
            }
        }

        tracing::debug!("dashboard sync stopped");
    }

    fn apply(&mut self, event: &ChangeEvent) {
        if matches!(event, ChangeEvent::Insert { .. }) {
            self.view.new_items += 1;
        }
        if let Some(notification) = notification_for(event) {
            if let Err(e) = self.notify_tx.try_send(notification) {
                tracing::debug!(error = %e, "dashboard notification dropped");
            }
        }
    }

    async fn reload(&mut self) {
        match self
            .source
            .load_page(&self.config.filter, self.config.page)
            .await
        {
            Ok(page) => {
                self.view.items = page.items;
                self.view.total = page.total;
                self.view.stats = page.stats;
                self.view.revision += 1;
                self.view_tx.send_replace(self.view.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, "dashboard reload failed; keeping previous view");
            }
        }
    }

    fn set_connected(&mut self, connected: bool) {
        self.view.connected = connected;
        self.connected_tx.send_replace(connected);
        self.view_tx.send_replace(self.view.clone());
    }
}
