use std::sync::Arc;
use std::time::Instant;

use permit_core::bulk::{BulkCoordinator, UndoRegistry};
use permit_core::notify::Notifier;
use permit_core::rbac::cache::DEFAULT_MAX_ENTRIES;
use permit_core::rbac::{AccessGuard, PermissionCache, PermissionResolver, RoleAdmin};
use permit_core::store::{ApplicationStore, RoleStore};
use permit_core::workflow::StatusWorkflow;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimitState;
use crate::services::documents::DocumentStorage;
use crate::services::payments::PaymentGateway;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ApplicationStore>,
    pub roles: Arc<dyn RoleStore>,
    pub resolver: PermissionResolver,
    pub guard: AccessGuard,
    pub role_admin: RoleAdmin,
    pub workflow: StatusWorkflow,
    pub bulk: BulkCoordinator,
    pub undo: UndoRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub payments: Option<Arc<dyn PaymentGateway>>,
    pub documents: DocumentStorage,
    pub metrics: Arc<Metrics>,
    pub rate_limit: RateLimitState,
    pub started_at: Instant,
}

impl AppState {
    pub fn new<S>(
        config: Config,
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        payments: Option<Arc<dyn PaymentGateway>>,
    ) -> Self
    where
        S: ApplicationStore + RoleStore + 'static,
    {
        let applications: Arc<dyn ApplicationStore> = store.clone();
        let roles: Arc<dyn RoleStore> = store;

        let cache = PermissionCache::new(config.permission_cache_ttl, DEFAULT_MAX_ENTRIES);
        let resolver = PermissionResolver::new(roles.clone(), cache)
            .with_admin_allowlist(config.admin_emails.iter().cloned());

        let max_batch = usize::try_from(config.dashboard_page_size).unwrap_or(usize::MAX);

        Self {
            store: applications.clone(),
            roles,
            guard: AccessGuard::new(resolver.clone()),
            role_admin: RoleAdmin::new(resolver.clone()),
            resolver,
            workflow: StatusWorkflow::new(applications.clone(), notifier.clone()),
            bulk: BulkCoordinator::new(applications).with_max_batch(max_batch),
            undo: UndoRegistry::default(),
            notifier,
            payments,
            documents: DocumentStorage::new(config.document_storage_dir.clone()),
            metrics: Arc::new(Metrics::default()),
            rate_limit: RateLimitState::new(&config.rate_limit),
            started_at: Instant::now(),
            config: Arc::new(config),
        }
    }
}
