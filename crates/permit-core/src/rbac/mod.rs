//! Role-based access control for portal operations.
//!
//! An identity (the lower-cased email) maps to one [`Role`], and each role
//! expands to a fixed set of [`Permission`]s. Resolution goes through an
//! injected [`PermissionCache`] and fails closed to the `user` role.

pub mod admin;
pub mod cache;
pub mod guard;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::ParseEnumError;
use crate::store::{RoleStore, StoreError};

pub use admin::RoleAdmin;
pub use cache::PermissionCache;
pub use guard::{can_view_route, AccessDenied, AccessGuard};

#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),
}

pub type Result<T> = std::result::Result<T, RbacError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub const ALL: [Role; 3] = [Self::User, Self::Admin, Self::SuperAdmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Admin => "Administrator",
            Self::SuperAdmin => "Super Administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "role",
                value: s.to_string(),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewOwnApplications,
    EditOwnApplications,
    DeleteOwnApplications,
    ViewAllApplications,
    EditAllApplications,
    DeleteAllApplications,
    ManageUsers,
    ManageAdmins,
    SystemSettings,
    AuditLogs,
    PerformanceMonitoring,
}

impl Permission {
    pub const ALL: [Permission; 11] = [
        Self::ViewOwnApplications,
        Self::EditOwnApplications,
        Self::DeleteOwnApplications,
        Self::ViewAllApplications,
        Self::EditAllApplications,
        Self::DeleteAllApplications,
        Self::ManageUsers,
        Self::ManageAdmins,
        Self::SystemSettings,
        Self::AuditLogs,
        Self::PerformanceMonitoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewOwnApplications => "view_own_applications",
            Self::EditOwnApplications => "edit_own_applications",
            Self::DeleteOwnApplications => "delete_own_applications",
            Self::ViewAllApplications => "view_all_applications",
            Self::EditAllApplications => "edit_all_applications",
            Self::DeleteAllApplications => "delete_all_applications",
            Self::ManageUsers => "manage_users",
            Self::ManageAdmins => "manage_admins",
            Self::SystemSettings => "system_settings",
            Self::AuditLogs => "audit_logs",
            Self::PerformanceMonitoring => "performance_monitoring",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const USER_PERMISSIONS: &[Permission] = &[
    Permission::ViewOwnApplications,
    Permission::EditOwnApplications,
    Permission::DeleteOwnApplications,
];

const ADMIN_PERMISSIONS: &[Permission] = &[
    Permission::ViewOwnApplications,
    Permission::EditOwnApplications,
    Permission::DeleteOwnApplications,
    Permission::ViewAllApplications,
    Permission::EditAllApplications,
    Permission::DeleteAllApplications,
    Permission::ManageUsers,
    Permission::AuditLogs,
    Permission::PerformanceMonitoring,
];

/// Static role table.
pub fn permissions_for_role(role: Role) -> &'static [Permission] {
    match role {
        Role::User => USER_PERMISSIONS,
        Role::Admin => ADMIN_PERMISSIONS,
        Role::SuperAdmin => &Permission::ALL,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPermissions {
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
}

impl ResolvedPermissions {
    pub fn for_role(role: Role) -> Self {
        Self {
            role,
            permissions: permissions_for_role(role).iter().copied().collect(),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin | Role::SuperAdmin)
    }

    pub fn is_super_admin(&self) -> bool {
        self.role == Role::SuperAdmin
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// False for an empty list.
    pub fn has_any_permission(&self, permissions: &[Permission]) -> bool {
        permissions.iter().any(|p| self.has_permission(*p))
    }

    /// True for an empty list.
    pub fn has_all_permissions(&self, permissions: &[Permission]) -> bool {
        permissions.iter().all(|p| self.has_permission(*p))
    }
}

/// Trim and lower-case an identity string.
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn RoleStore>,
    cache: PermissionCache,
    admin_allowlist: Arc<HashSet<String>>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn RoleStore>, cache: PermissionCache) -> Self {
        Self {
            store,
            cache,
            admin_allowlist: Arc::new(HashSet::new()),
        }
    }

    /// Identities in the allowlist resolve to at least `admin`.
    pub fn with_admin_allowlist<I, S>(mut self, emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.admin_allowlist = Arc::new(
            emails
                .into_iter()
                .map(|e| normalize_identity(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        );
        self
    }

    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RoleStore> {
        &self.store
    }

    /// Never fails: a missing role row or a lookup error resolves to `user`.
    pub async fn resolve(&self, identity: &str) -> ResolvedPermissions {
        let key = normalize_identity(identity);
        if key.is_empty() {
            return ResolvedPermissions::for_role(Role::User);
        }

        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }

        let generation = self.cache.generation();
        let stored = match self.store.role_for(&key).await {
            Ok(role) => role.unwrap_or(Role::User),
            Err(e) => {
                tracing::warn!(identity = %key, error = %e, "role lookup failed; using user role");
                Role::User
            }
        };

        let role = if stored == Role::User && self.admin_allowlist.contains(&key) {
            Role::Admin
        } else {
            stored
        };

        let resolved = ResolvedPermissions::for_role(role);
        // An invalidation during the lookup means the row we read may be stale.
        if !self.cache.insert_if_current(&key, resolved.clone(), generation) {
            tracing::debug!(identity = %key, "permissions invalidated during lookup; not cached");
        }
        resolved
    }

    pub fn invalidate(&self, identity: &str) {
        self.cache.invalidate(&normalize_identity(identity));
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::test_support::CountingRoles;
    use super::*;

    fn resolver(store: Arc<CountingRoles>) -> PermissionResolver {
        PermissionResolver::new(store, PermissionCache::new(Duration::from_secs(300), 100))
    }

    #[test]
    fn role_tables_are_nested() {
        let user: HashSet<_> = permissions_for_role(Role::User).iter().collect();
        let admin: HashSet<_> = permissions_for_role(Role::Admin).iter().collect();
        let super_admin: HashSet<_> = permissions_for_role(Role::SuperAdmin).iter().collect();
        assert!(user.is_subset(&admin));
        assert!(admin.is_subset(&super_admin));
        assert_eq!(super_admin.len(), Permission::ALL.len());
        assert!(!admin.contains(&Permission::ManageAdmins));
        assert!(!admin.contains(&Permission::SystemSettings));
    }

    #[test]
    fn derived_checks_on_empty_lists() {
        let user = ResolvedPermissions::for_role(Role::User);
        assert!(!user.has_any_permission(&[]));
        assert!(user.has_all_permissions(&[]));
        assert!(user.has_any_permission(&[
            Permission::ManageUsers,
            Permission::ViewOwnApplications
        ]));
        assert!(!user.has_all_permissions(&[
            Permission::ManageUsers,
            Permission::ViewOwnApplications
        ]));
    }

    #[test]
    fn role_names() {
        assert_eq!("super_admin".parse::<Role>(), Ok(Role::SuperAdmin));
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::Admin.display_name(), "Administrator");
    }

    #[tokio::test]
    async fn unknown_identity_resolves_to_user() {
        let store = Arc::new(CountingRoles::new());
        let resolved = resolver(store).resolve("nobody@example.com").await;
        assert_eq!(resolved, ResolvedPermissions::for_role(Role::User));
        assert!(!resolved.is_admin());
        assert!(!resolved.is_super_admin());
    }

    #[tokio::test]
    async fn empty_identity_skips_the_store() {
        let store = Arc::new(CountingRoles::new());
        let resolver = resolver(store.clone());
        let resolved = resolver.resolve("   ").await;
        assert_eq!(resolved.role, Role::User);
        assert_eq!(store.lookups(), 0);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn repeated_resolves_hit_the_cache() {
        let store = Arc::new(CountingRoles::new());
        store
            .upsert_role("admin@example.com", Role::Admin)
            .await
            .expect("seed");
        let resolver = resolver(store.clone());

        let first = resolver.resolve("Admin@Example.com ").await;
        let second = resolver.resolve("admin@example.com").await;
        assert_eq!(first, second);
        assert!(first.is_admin());
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_lookup() {
        let store = Arc::new(CountingRoles::new());
        let resolver = resolver(store.clone());

        assert_eq!(resolver.resolve("a@b.co").await.role, Role::User);
        store
            .upsert_role("a@b.co", Role::SuperAdmin)
            .await
            .expect("grant");
        assert_eq!(resolver.resolve("a@b.co").await.role, Role::User);

        resolver.invalidate("A@B.CO");
        assert_eq!(resolver.resolve("a@b.co").await.role, Role::SuperAdmin);
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_requeried() {
        let store = Arc::new(CountingRoles::new());
        let resolver = PermissionResolver::new(
            store.clone(),
            PermissionCache::new(Duration::from_secs(300), 100),
        );

        resolver.resolve("a@b.co").await;
        tokio::time::advance(Duration::from_secs(301)).await;
        resolver.resolve("a@b.co").await;
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test]
    async fn lookup_errors_fail_closed() {
        let store = Arc::new(CountingRoles::new());
        store
            .upsert_role("admin@example.com", Role::Admin)
            .await
            .expect("seed");
        store.failing.store(true, Ordering::SeqCst);

        let resolved = resolver(store).resolve("admin@example.com").await;
        assert_eq!(resolved.role, Role::User);
    }

    type Gate = (
        tokio::sync::oneshot::Sender<()>,
        tokio::sync::oneshot::Receiver<()>,
    );

    /// Role store whose first lookup parks after reading until released.
    struct GatedRoles {
        inner: crate::store::memory::MemoryStore,
        gate: std::sync::Mutex<Option<Gate>>,
    }

    #[async_trait::async_trait]
    impl RoleStore for GatedRoles {
        async fn role_for(&self, user_id: &str) -> crate::store::Result<Option<Role>> {
            let role = self.inner.role_for(user_id).await?;
            let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some((read_done, release)) = gate {
                let _ = read_done.send(());
                let _ = release.await;
            }
            Ok(role)
        }

        async fn upsert_role(&self, user_id: &str, role: Role) -> crate::store::Result<()> {
            self.inner.upsert_role(user_id, role).await
        }

        async fn list_roles(&self) -> crate::store::Result<Vec<crate::store::UserRoleRecord>> {
            self.inner.list_roles().await
        }
    }

    #[tokio::test]
    async fn assignment_during_an_inflight_lookup_is_not_overwritten() {
        let (read_tx, read_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let store = Arc::new(GatedRoles {
            inner: crate::store::memory::MemoryStore::new(),
            gate: std::sync::Mutex::new(Some((read_tx, release_rx))),
        });
        let resolver = resolver_over(store);
        let roles = RoleAdmin::new(resolver.clone());

        let lookup = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("clerk@example.com").await }
        });
        read_rx.await.expect("lookup read the store");

        roles
            .assign(
                &ResolvedPermissions::for_role(Role::SuperAdmin),
                "clerk@example.com",
                Role::Admin,
            )
            .await
            .expect("assign");
        release_tx.send(()).expect("lookup still parked");

        // The parked lookup saw the old row; it must not be cached.
        assert_eq!(lookup.await.expect("join").role, Role::User);
        assert_eq!(resolver.resolve("clerk@example.com").await.role, Role::Admin);
    }

    fn resolver_over(store: Arc<GatedRoles>) -> PermissionResolver {
        PermissionResolver::new(store, PermissionCache::new(Duration::from_secs(300), 100))
    }

    #[tokio::test]
    async fn allowlist_promotes_but_never_demotes() {
        let store = Arc::new(CountingRoles::new());
        store
            .upsert_role("boss@example.com", Role::SuperAdmin)
            .await
            .expect("seed");
        let resolver = resolver(store).with_admin_allowlist(["Clerk@Example.com", "boss@example.com"]);

        assert_eq!(resolver.resolve("clerk@example.com").await.role, Role::Admin);
        assert_eq!(resolver.resolve("boss@example.com").await.role, Role::SuperAdmin);
        assert_eq!(resolver.resolve("citizen@example.com").await.role, Role::User);
    }
}
