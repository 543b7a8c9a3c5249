//! Role based access control: permission codes, inheritance and checks.

pub mod hierarchy;
mod models;
mod repo;
pub mod resolver;
mod service;

pub use models::{Permission, PermissionCode, PermissionParseError, Role, SYSTEM_RESOURCE, WILDCARD};
pub use repo::RoleStore;
pub use resolver::{MatchKind, PermissionSet, RoleCatalog};
pub use service::{Authorizer, Grant};
