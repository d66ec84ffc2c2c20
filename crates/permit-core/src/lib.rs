#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Core of the municipal permit portal.
//!
//! - [`rbac`]: identity to role and permission resolution, with a TTL cache and
//!   the access guard built on it
//! - [`workflow`]: submission and status transitions of applications
//! - [`bulk`]: set-based status changes with undo
//! - [`sync`]: the per-view dashboard reconciliation loop
//! - [`store`]: persistence traits and an in-memory implementation

pub mod bulk;
pub mod model;
pub mod notify;
pub mod rbac;
pub mod store;
pub mod sync;
pub mod validation;
pub mod workflow;

pub use model::{Application, ApplicationStatus, ApplicationType, ChangeEvent};
pub use rbac::{Permission, PermissionResolver, ResolvedPermissions, Role};
pub use store::{ApplicationStore, RoleStore, StoreError};
pub use workflow::StatusWorkflow;
