//! Role assignment by staff.

use super::{
    normalize_identity, Permission, PermissionResolver, RbacError, ResolvedPermissions, Result,
    Role,
};
use crate::store::UserRoleRecord;

#[derive(Clone)]
pub struct RoleAdmin {
    resolver: PermissionResolver,
}

impl RoleAdmin {
    pub fn new(resolver: PermissionResolver) -> Self {
        Self { resolver }
    }

    /// Permission needed to hand out (or take away) `role`.
    pub fn permission_to_assign(role: Role) -> Permission {
        match role {
            Role::User => Permission::ManageUsers,
            Role::Admin | Role::SuperAdmin => Permission::ManageAdmins,
        }
    }

    /// Upsert the role of `user_id` and drop its cached permissions.
    ///
    /// Changing the role of someone who is currently an admin counts as
    /// revoking that role and needs the same permission as granting it.
    pub async fn assign(
        &self,
        actor: &ResolvedPermissions,
        user_id: &str,
        role: Role,
    ) -> Result<UserRoleRecord> {
        let user_id = normalize_identity(user_id);
        if user_id.is_empty() {
            return Err(RbacError::InvalidIdentity(user_id));
        }

        let current = self
            .resolver
            .store()
            .role_for(&user_id)
            .await?
            .unwrap_or(Role::User);

        for needed in [
            Self::permission_to_assign(role),
            Self::permission_to_assign(current),
        ] {
            if !actor.has_permission(needed) {
                return Err(RbacError::Forbidden(format!(
                    "changing {user_id} from {current} to {role} requires {needed}"
                )));
            }
        }

        self.resolver.store().upsert_role(&user_id, role).await?;
        self.resolver.invalidate(&user_id);
        tracing::info!(user_id = %user_id, role = %role, previous = %current, "role assigned");

        Ok(UserRoleRecord { user_id, role })
    }

    pub async fn list(&self) -> Result<Vec<UserRoleRecord>> {
        Ok(self.resolver.store().list_roles().await?)
    }
}
