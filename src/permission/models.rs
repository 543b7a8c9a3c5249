//! Permission codes and roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const WILDCARD: &str = "*";
pub const SYSTEM_RESOURCE: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionParseError {
    #[error("permission code must be resource:action[:scope], got {0:?}")]
    Format(String),
}

/// A `resource:action[:scope]` permission code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionCode {
    resource: String,
    action: String,
    scope: Option<String>,
}

impl PermissionCode {
    /// # Errors
    /// Fails when resource or action is empty or contains a colon.
    pub fn new(resource: &str, action: &str, scope: Option<&str>) -> Result<Self, PermissionParseError> {
        let valid = |part: &str| !part.is_empty() && !part.contains(':') && !part.contains(char::is_whitespace);
        if !valid(resource) || !valid(action) || scope.is_some_and(|s| !valid(s)) {
            let rendered = match scope {
                Some(scope) => format!("{resource}:{action}:{scope}"),
                None => format!("{resource}:{action}"),
            };
            return Err(PermissionParseError::Format(rendered));
        }
        Ok(Self {
            resource: resource.to_string(),
            action: action.to_string(),
            scope: scope.map(str::to_string),
        })
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// `*:*` or `system:*`.
    #[must_use]
    pub fn is_global(&self) -> bool {
        (self.resource == WILDCARD || self.resource == SYSTEM_RESOURCE) && self.action == WILDCARD
    }
}

impl fmt::Display for PermissionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}:{scope}", self.resource, self.action),
            None => write!(f, "{}:{}", self.resource, self.action),
        }
    }
}

impl FromStr for PermissionCode {
    type Err = PermissionParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.trim().split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(resource), Some(action), scope, None) => Self::new(resource, action, scope),
            _ => Err(PermissionParseError::Format(value.to_string())),
        }
    }
}

impl TryFrom<String> for PermissionCode {
    type Error = PermissionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PermissionCode> for String {
    fn from(code: PermissionCode) -> Self {
        code.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub id: Uuid,
    pub code: PermissionCode,
    pub description: Option<String>,
    /// System permissions ship with the deployment and cannot be deleted.
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    /// Informational ordering; not used for resolution.
    pub level: i32,
    pub parent_id: Option<Uuid>,
    pub permissions: Vec<Permission>,
    pub organization_id: Option<Uuid>,
}
