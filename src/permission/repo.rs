//! Persistence boundary for roles and role assignments.

use async_trait::async_trait;
use uuid::Uuid;

use super::models::Role;
use super::resolver::RoleCatalog;
use crate::error::StoreError;

#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Snapshot of every role with its permissions.
    async fn catalog(&self) -> Result<RoleCatalog, StoreError>;

    /// Insert or update a role and replace its permission set. Permission
    /// codes are created on first use.
    async fn save_role(&self, role: &Role) -> Result<(), StoreError>;

    async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), StoreError>;

    async fn unassign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), StoreError>;
}
