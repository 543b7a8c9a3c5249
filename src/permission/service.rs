//! Authorization decisions and role administration over the stores.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::hierarchy;
use super::models::Role;
use super::repo::RoleStore;
use super::resolver::{self, PermissionSet};
use crate::error::AuthError;
use crate::principal::{Principal, PrincipalStore};
use crate::session::PrivilegeLevel;

/// Roles, permissions and privilege resolved for one principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub roles: Vec<String>,
    pub permissions: PermissionSet,
    pub privilege: PrivilegeLevel,
}

pub struct Authorizer {
    principals: Arc<dyn PrincipalStore>,
    roles: Arc<dyn RoleStore>,
}

impl Authorizer {
    #[must_use]
    pub fn new(principals: Arc<dyn PrincipalStore>, roles: Arc<dyn RoleStore>) -> Self {
        Self { principals, roles }
    }

    /// Whether the principal may perform `action` on `resource`. Unknown,
    /// deactivated and disabled principals are denied.
    ///
    /// # Errors
    /// `DependencyUnavailable` when a store fails.
    pub async fn authorize(&self, principal_id: Uuid, resource: &str, action: &str) -> Result<bool, AuthError> {
        let Some(principal) = self.principals.find_by_id(principal_id).await? else {
            return Ok(false);
        };
        if !principal.is_active || principal.is_disabled {
            return Ok(false);
        }
        let catalog = self.roles.catalog().await?;
        let allowed = resolver::has_permission(&principal, &catalog, resource, action);
        debug!(principal_id = %principal_id, resource, action, allowed, "Authorization decision");
        Ok(allowed)
    }

    /// Snapshot used when minting access tokens.
    ///
    /// # Errors
    /// `DependencyUnavailable` when the role store fails.
    pub async fn grant_for(&self, principal: &Principal) -> Result<Grant, AuthError> {
        let catalog = self.roles.catalog().await?;
        Ok(Grant {
            roles: catalog.role_names(&principal.role_ids),
            permissions: resolver::effective_permissions(principal, &catalog),
            privilege: resolver::privilege_level(principal, &catalog),
        })
    }

    /// Validate the hierarchy and persist the role.
    ///
    /// # Errors
    /// `Configuration` on a cycle, dangling parent or over-deep chain.
    pub async fn save_role(&self, role: &Role) -> Result<(), AuthError> {
        let catalog = self.roles.catalog().await?;
        hierarchy::validate(&catalog, role).map_err(|err| AuthError::Configuration(err.to_string()))?;
        self.roles.save_role(role).await?;
        info!(role = %role.name, parent = ?role.parent_id, "Role saved");
        Ok(())
    }

    /// # Errors
    /// `Configuration` if the role does not exist.
    pub async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), AuthError> {
        let catalog = self.roles.catalog().await?;
        if catalog.get(role_id).is_none() {
            return Err(AuthError::Configuration(format!("unknown role {role_id}")));
        }
        self.roles.assign_role(principal_id, role_id).await?;
        Ok(())
    }

    /// # Errors
    /// `DependencyUnavailable` when the role store fails.
    pub async fn unassign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), AuthError> {
        self.roles.unassign_role(principal_id, role_id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::principal::NewPrincipal;
    use crate::store::memory::{MemoryPrincipalStore, MemoryRoleStore};
    use chrono::Utc;

    fn role(name: &str, parent_id: Option<Uuid>, codes: &[&str]) -> Role {
        Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            level: 0,
            parent_id,
            permissions: codes
                .iter()
                .map(|code| Permission {
                    id: Uuid::new_v4(),
                    code: code.parse().unwrap(),
                    description: None,
                    is_system: false,
                })
                .collect(),
            organization_id: None,
        }
    }

    async fn setup() -> (Authorizer, Arc<MemoryPrincipalStore>, Uuid) {
        let principals = Arc::new(MemoryPrincipalStore::new());
        let roles = Arc::new(MemoryRoleStore::new(principals.clone()));
        let principal = principals
            .create(
                NewPrincipal {
                    email: "alice@example.com".to_string(),
                    credential_hash: None,
                    is_verified: true,
                    role_ids: Vec::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        (Authorizer::new(principals.clone(), roles), principals, principal.id)
    }

    #[tokio::test]
    async fn authorize_through_assigned_role() {
        let (authorizer, _, principal_id) = setup().await;
        let viewer = role("viewer", None, &["posts:read"]);
        let editor = role("editor", Some(viewer.id), &["posts:write"]);
        authorizer.save_role(&viewer).await.unwrap();
        authorizer.save_role(&editor).await.unwrap();
        authorizer.assign_role(principal_id, editor.id).await.unwrap();

        assert!(authorizer.authorize(principal_id, "posts", "read").await.unwrap());
        assert!(authorizer.authorize(principal_id, "posts", "write").await.unwrap());
        assert!(!authorizer.authorize(principal_id, "users", "read").await.unwrap());

        authorizer.unassign_role(principal_id, editor.id).await.unwrap();
        assert!(!authorizer.authorize(principal_id, "posts", "read").await.unwrap());
    }

    #[tokio::test]
    async fn cycle_is_rejected_at_save_time() {
        let (authorizer, _, _) = setup().await;
        let top = role("top", None, &[]);
        let bottom = role("bottom", Some(top.id), &[]);
        authorizer.save_role(&top).await.unwrap();
        authorizer.save_role(&bottom).await.unwrap();

        let mut looped = top.clone();
        looped.parent_id = Some(bottom.id);
        let err = authorizer.save_role(&looped).await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn unknown_and_disabled_principals_are_denied() {
        let (authorizer, principals, principal_id) = setup().await;
        assert!(!authorizer.authorize(Uuid::new_v4(), "posts", "read").await.unwrap());

        principals.modify(principal_id, |p| {
            p.is_superuser = true;
            p.is_disabled = true;
        });
        assert!(!authorizer.authorize(principal_id, "posts", "read").await.unwrap());
    }

    #[tokio::test]
    async fn grant_snapshot_lists_roles_and_permissions() {
        let (authorizer, principals, principal_id) = setup().await;
        let moderator = role("moderator", None, &["comments:*"]);
        authorizer.save_role(&moderator).await.unwrap();
        authorizer.assign_role(principal_id, moderator.id).await.unwrap();

        let principal = principals.find_by_id(principal_id).await.unwrap().unwrap();
        let grant = authorizer.grant_for(&principal).await.unwrap();
        assert_eq!(grant.roles, vec!["moderator"]);
        assert_eq!(grant.permissions.to_strings(), vec!["comments:*"]);
        assert_eq!(grant.privilege, PrivilegeLevel::Moderator);
    }

    #[tokio::test]
    async fn assigning_unknown_role_is_a_configuration_error() {
        let (authorizer, _, principal_id) = setup().await;
        let err = authorizer
            .assign_role(principal_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }
}
