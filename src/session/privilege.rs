//! Ordered privilege levels carried by sessions and access tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeLevel {
    Guest,
    User,
    Moderator,
    Admin,
    SuperAdmin,
}

impl PrivilegeLevel {
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Guest => 0,
            Self::User => 1,
            Self::Moderator => 2,
            Self::Admin => 3,
            Self::SuperAdmin => 4,
        }
    }

    /// Levels that get the short idle window.
    #[must_use]
    pub const fn is_elevated(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    /// Map a system role name onto a level; unknown names grant nothing.
    #[must_use]
    pub fn from_role_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivilegeLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Self::Guest),
            "user" => Ok(Self::User),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            "super_admin" | "superadmin" => Ok(Self::SuperAdmin),
            other => Err(format!("unknown privilege level: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(PrivilegeLevel::Guest < PrivilegeLevel::User);
        assert!(PrivilegeLevel::Admin < PrivilegeLevel::SuperAdmin);
        assert_eq!(PrivilegeLevel::Moderator.rank(), 2);
    }

    #[test]
    fn elevated_levels() {
        assert!(PrivilegeLevel::Admin.is_elevated());
        assert!(PrivilegeLevel::SuperAdmin.is_elevated());
        assert!(!PrivilegeLevel::Moderator.is_elevated());
    }

    #[test]
    fn parse_round_trips_names() {
        assert_eq!("super_admin".parse(), Ok(PrivilegeLevel::SuperAdmin));
        assert_eq!(PrivilegeLevel::from_role_name("Admin"), Some(PrivilegeLevel::Admin));
        assert_eq!(PrivilegeLevel::from_role_name("editor"), None);
    }
}
