//! Role hierarchy validation, run when a role is saved.

use std::collections::HashSet;

use thiserror::Error;
use uuid::Uuid;

use super::models::Role;
use super::resolver::{RoleCatalog, MAX_INHERITANCE_DEPTH};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    #[error("role {role} would create an inheritance cycle")]
    Cycle { role: String },
    #[error("role {role} references unknown parent {parent}")]
    UnknownParent { role: String, parent: Uuid },
    #[error("role {role} exceeds the maximum inheritance depth")]
    TooDeep { role: String },
    #[error("role name must not be empty")]
    EmptyName,
}

/// Check that saving `candidate` (new or updated) keeps the hierarchy a
/// set of finite single-parent chains.
///
/// # Errors
/// Returns the first problem found walking up from `candidate`.
pub fn validate(catalog: &RoleCatalog, candidate: &Role) -> Result<(), HierarchyError> {
    if candidate.name.trim().is_empty() {
        return Err(HierarchyError::EmptyName);
    }

    let mut visited = HashSet::from([candidate.id]);
    let mut parent = candidate.parent_id;
    let mut depth = 0;
    let mut child_name = candidate.name.clone();

    while let Some(parent_id) = parent {
        if !visited.insert(parent_id) {
            return Err(HierarchyError::Cycle {
                role: candidate.name.clone(),
            });
        }
        let Some(role) = catalog.get(parent_id) else {
            return Err(HierarchyError::UnknownParent {
                role: child_name,
                parent: parent_id,
            });
        };
        depth += 1;
        if depth > MAX_INHERITANCE_DEPTH {
            return Err(HierarchyError::TooDeep {
                role: candidate.name.clone(),
            });
        }
        child_name.clone_from(&role.name);
        parent = role.parent_id;
    }
    Ok(())
}
