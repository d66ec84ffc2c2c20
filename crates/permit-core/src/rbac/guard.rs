//! Authorization decisions over resolved permissions.

use super::{Permission, PermissionResolver, ResolvedPermissions};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{identity} lacks {}", format_required(.required))]
pub struct AccessDenied {
    pub identity: String,
    pub required: Vec<Permission>,
}

fn format_required(required: &[Permission]) -> String {
    required
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(" or ")
}

#[derive(Clone)]
pub struct AccessGuard {
    resolver: PermissionResolver,
}

impl AccessGuard {
    pub fn new(resolver: PermissionResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    pub async fn require(
        &self,
        identity: &str,
        permission: Permission,
    ) -> Result<ResolvedPermissions, AccessDenied> {
        self.require_any(identity, &[permission]).await
    }

    pub async fn require_any(
        &self,
        identity: &str,
        permissions: &[Permission],
    ) -> Result<ResolvedPermissions, AccessDenied> {
        let resolved = self.resolver.resolve(identity).await;
        if resolved.has_any_permission(permissions) {
            return Ok(resolved);
        }

        tracing::info!(
            identity = %identity,
            role = %resolved.role,
            required = %format_required(permissions),
            "access denied"
        );
        Err(AccessDenied {
            identity: identity.to_string(),
            required: permissions.to_vec(),
        })
    }
}

/// Whether a dashboard route should be shown to the holder of `resolved`.
pub fn can_view_route(path: &str, resolved: &ResolvedPermissions) -> bool {
    let path = path.trim_end_matches('/');
    if is_under(path, "/admin/users") {
        return resolved.has_permission(Permission::ManageUsers);
    }
    if is_under(path, "/admin/monitoring") {
        return resolved.has_permission(Permission::PerformanceMonitoring);
    }
    if is_under(path, "/admin") {
        return resolved.has_permission(Permission::ViewAllApplications);
    }
    true
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
