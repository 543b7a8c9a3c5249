//! Server-side sessions: lifecycle, persistence and security guard.

mod guard;
mod manager;
mod models;
mod privilege;
mod repo;

pub use guard::SessionGuard;
pub use manager::{IssuedSession, SessionManager};
pub(crate) use models::normalize_ip;
pub use models::{EndReason, Session, SessionConfig, SessionStatus};
pub use privilege::PrivilegeLevel;
pub use repo::SessionStore;
