//! Effective permission resolution.
//!
//! Every function here is pure over a [`RoleCatalog`] snapshot and the
//! principal record, so calling it twice with the same inputs yields the
//! same answer.

use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

use super::models::{PermissionCode, Role, WILDCARD};
use crate::principal::Principal;
use crate::session::PrivilegeLevel;

/// Maximum number of parent hops followed from any role.
pub const MAX_INHERITANCE_DEPTH: usize = 10;

/// Immutable snapshot of every role, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RoleCatalog {
    roles: HashMap<Uuid, Role>,
}

impl RoleCatalog {
    #[must_use]
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            roles: roles.into_iter().map(|role| (role.id, role)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Role> {
        self.roles.get(&id)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Role> {
        self.roles.values().find(|role| role.name == name)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    /// Names of the given roles that exist in the catalog, sorted.
    #[must_use]
    pub fn role_names(&self, role_ids: &[Uuid]) -> Vec<String> {
        let names: BTreeSet<String> = role_ids
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|role| role.name.clone())
            .collect();
        names.into_iter().collect()
    }

    /// Own permissions of a role followed by those inherited up the parent
    /// chain, deduplicated. The walk stops after [`MAX_INHERITANCE_DEPTH`]
    /// hops, on a repeated role, or on a dangling parent.
    #[must_use]
    pub fn inherited_permissions(&self, role_id: Uuid) -> Vec<PermissionCode> {
        let mut seen_codes = HashSet::new();
        let mut codes = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.get(role_id);
        let mut hops = 0;

        while let Some(role) = current {
            if !visited.insert(role.id) {
                break;
            }
            for permission in &role.permissions {
                if seen_codes.insert(permission.code.clone()) {
                    codes.push(permission.code.clone());
                }
            }
            if hops == MAX_INHERITANCE_DEPTH {
                break;
            }
            hops += 1;
            current = role.parent_id.and_then(|parent| self.get(parent));
        }
        codes
    }
}

/// Which check granted a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    ResourceWildcard,
    ActionWildcard,
    Global,
}

/// Deduplicated permissions held by a principal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    codes: BTreeSet<PermissionCode>,
}

impl PermissionSet {
    #[must_use]
    pub fn new(codes: impl IntoIterator<Item = PermissionCode>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionCode> {
        self.codes.iter()
    }

    /// Codes rendered as strings, in sorted order.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.codes.iter().map(ToString::to_string).collect()
    }

    /// Match `resource:action` (optionally scoped) against the set.
    ///
    /// Checks run in order: exact, `resource:*`, `*:action`, global. Exact
    /// and wildcard grants are equally authoritative; any match grants. A
    /// held code with a scope only grants requests for that same scope,
    /// while an unscoped held code grants every scope.
    #[must_use]
    pub fn grants(&self, resource: &str, action: &str, scope: Option<&str>) -> Option<MatchKind> {
        let held: Vec<&PermissionCode> = self
            .codes
            .iter()
            .filter(|code| code.scope().is_none() || code.scope() == scope)
            .collect();

        if held
            .iter()
            .any(|code| code.resource() == resource && code.action() == action)
        {
            return Some(MatchKind::Exact);
        }
        if held
            .iter()
            .any(|code| code.resource() == resource && code.action() == WILDCARD)
        {
            return Some(MatchKind::ResourceWildcard);
        }
        if held
            .iter()
            .any(|code| code.resource() == WILDCARD && code.action() == action)
        {
            return Some(MatchKind::ActionWildcard);
        }
        if held.iter().any(|code| code.is_global()) {
            return Some(MatchKind::Global);
        }
        None
    }
}

/// Role inherited permissions of every role plus the direct grants.
#[must_use]
pub fn effective_permissions(principal: &Principal, catalog: &RoleCatalog) -> PermissionSet {
    let mut codes: Vec<PermissionCode> = principal
        .role_ids
        .iter()
        .flat_map(|role_id| catalog.inherited_permissions(*role_id))
        .collect();
    codes.extend(principal.direct_permissions.iter().cloned());
    PermissionSet::new(codes)
}

#[must_use]
pub fn has_permission(principal: &Principal, catalog: &RoleCatalog, resource: &str, action: &str) -> bool {
    if principal.is_superuser {
        return true;
    }
    effective_permissions(principal, catalog)
        .grants(resource, action, None)
        .is_some()
}

#[must_use]
pub fn has_any_permission(principal: &Principal, catalog: &RoleCatalog, requested: &[(&str, &str)]) -> bool {
    if principal.is_superuser {
        return true;
    }
    let held = effective_permissions(principal, catalog);
    requested
        .iter()
        .any(|(resource, action)| held.grants(resource, action, None).is_some())
}

#[must_use]
pub fn has_all_permissions(principal: &Principal, catalog: &RoleCatalog, requested: &[(&str, &str)]) -> bool {
    if principal.is_superuser {
        return true;
    }
    let held = effective_permissions(principal, catalog);
    requested
        .iter()
        .all(|(resource, action)| held.grants(resource, action, None).is_some())
}

/// Highest privilege implied by the principal's role names; superusers are
/// `SuperAdmin`, everyone else at least `User`.
#[must_use]
pub fn privilege_level(principal: &Principal, catalog: &RoleCatalog) -> PrivilegeLevel {
    if principal.is_superuser {
        return PrivilegeLevel::SuperAdmin;
    }
    principal
        .role_ids
        .iter()
        .filter_map(|id| catalog.get(*id))
        .filter_map(|role| PrivilegeLevel::from_role_name(&role.name))
        .max()
        .map_or(PrivilegeLevel::User, |level| level.max(PrivilegeLevel::User))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::principal::test_principal;
    use chrono::Utc;

    fn permission(code: &str) -> Permission {
        Permission {
            id: Uuid::new_v4(),
            code: code.parse().unwrap(),
            description: None,
            is_system: false,
        }
    }

    fn role(name: &str, parent_id: Option<Uuid>, codes: &[&str]) -> Role {
        Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            level: 0,
            parent_id,
            permissions: codes.iter().map(|code| permission(code)).collect(),
            organization_id: None,
        }
    }

    fn principal_with(role_ids: Vec<Uuid>, direct: &[&str]) -> Principal {
        let mut principal = test_principal("alice@example.com", Utc::now());
        principal.role_ids = role_ids;
        principal.direct_permissions = direct.iter().map(|code| code.parse().unwrap()).collect();
        principal
    }

    #[test]
    fn global_permissions_grant_everything() {
        for global in ["system:*", "*:*"] {
            let principal = principal_with(Vec::new(), &[global]);
            let catalog = RoleCatalog::default();
            assert!(has_permission(&principal, &catalog, "users", "delete"));
            assert!(has_permission(&principal, &catalog, "billing", "read"));
        }
    }

    #[test]
    fn resource_wildcard_is_limited_to_its_resource() {
        let principal = principal_with(Vec::new(), &["posts:*"]);
        let catalog = RoleCatalog::default();
        assert!(has_permission(&principal, &catalog, "posts", "read"));
        assert!(has_permission(&principal, &catalog, "posts", "write"));
        assert!(!has_permission(&principal, &catalog, "users", "read"));
    }

    #[test]
    fn action_wildcard_matches_every_resource() {
        let held = PermissionSet::new(["*:read".parse().unwrap()]);
        assert_eq!(held.grants("users", "read", None), Some(MatchKind::ActionWildcard));
        assert_eq!(held.grants("users", "write", None), None);
    }

    #[test]
    fn exact_and_wildcard_are_equally_authoritative() {
        let held = PermissionSet::new(["posts:read".parse().unwrap(), "posts:*".parse().unwrap()]);
        assert_eq!(held.grants("posts", "read", None), Some(MatchKind::Exact));
        assert_eq!(held.grants("posts", "delete", None), Some(MatchKind::ResourceWildcard));
    }

    #[test]
    fn scoped_grants_only_cover_their_scope() {
        let held = PermissionSet::new(["posts:edit:own".parse().unwrap()]);
        assert!(held.grants("posts", "edit", None).is_none());
        assert!(held.grants("posts", "edit", Some("own")).is_some());
        assert!(held.grants("posts", "edit", Some("any")).is_none());

        let unscoped = PermissionSet::new(["posts:edit".parse().unwrap()]);
        assert!(unscoped.grants("posts", "edit", Some("own")).is_some());
    }

    #[test]
    fn permissions_are_inherited_up_the_chain() {
        let viewer = role("viewer", None, &["posts:read"]);
        let editor = role("editor", Some(viewer.id), &["posts:write", "posts:read"]);
        let principal = principal_with(vec![editor.id], &["profile:update"]);
        let catalog = RoleCatalog::new([viewer, editor]);

        let effective = effective_permissions(&principal, &catalog);
        assert_eq!(
            effective.to_strings(),
            vec!["posts:read", "posts:write", "profile:update"]
        );
        assert!(has_permission(&principal, &catalog, "posts", "read"));
        assert!(!has_permission(&principal, &catalog, "posts", "delete"));
    }

    #[test]
    fn cyclic_chains_terminate() {
        let mut first = role("first", None, &["a:read"]);
        let second = role("second", Some(first.id), &["b:read"]);
        first.parent_id = Some(second.id);
        let catalog = RoleCatalog::new([first.clone(), second]);

        let codes = catalog.inherited_permissions(first.id);
        assert_eq!(codes.len(), 2);
    }

    #[test]
    fn depth_is_capped() {
        let mut roles = Vec::new();
        let mut parent = None;
        for idx in 0..15 {
            let code = format!("r{idx}:read");
            let role = role(&format!("role{idx}"), parent, &[code.as_str()]);
            parent = Some(role.id);
            roles.push(role);
        }
        let leaf = roles[14].id;
        let catalog = RoleCatalog::new(roles);
        let codes = catalog.inherited_permissions(leaf);
        assert_eq!(codes.len(), MAX_INHERITANCE_DEPTH + 1);
    }

    #[test]
    fn superuser_short_circuits() {
        let mut principal = principal_with(Vec::new(), &[]);
        principal.is_superuser = true;
        assert!(has_permission(&principal, &RoleCatalog::default(), "anything", "goes"));
        assert_eq!(
            privilege_level(&principal, &RoleCatalog::default()),
            PrivilegeLevel::SuperAdmin
        );
    }

    #[test]
    fn authorization_is_idempotent() {
        let editor = role("editor", None, &["posts:write"]);
        let principal = principal_with(vec![editor.id], &[]);
        let catalog = RoleCatalog::new([editor]);
        let first = has_permission(&principal, &catalog, "posts", "write");
        let second = has_permission(&principal, &catalog, "posts", "write");
        assert_eq!(first, second);
    }

    #[test]
    fn any_and_all_helpers() {
        let principal = principal_with(Vec::new(), &["posts:read"]);
        let catalog = RoleCatalog::default();
        assert!(has_any_permission(&principal, &catalog, &[("users", "read"), ("posts", "read")]));
        assert!(!has_all_permissions(&principal, &catalog, &[("users", "read"), ("posts", "read")]));
        assert!(has_all_permissions(&principal, &catalog, &[("posts", "read")]));
    }

    #[test]
    fn privilege_follows_system_role_names() {
        let admin = role("admin", None, &[]);
        let moderator = role("moderator", None, &[]);
        let custom = role("editor", None, &[]);
        let principal = principal_with(vec![moderator.id, admin.id, custom.id], &[]);
        let catalog = RoleCatalog::new([admin, moderator, custom.clone()]);
        assert_eq!(privilege_level(&principal, &catalog), PrivilegeLevel::Admin);

        let plain = principal_with(vec![custom.id], &[]);
        assert_eq!(privilege_level(&plain, &catalog), PrivilegeLevel::User);
    }
}
