//! Quota tables, environment profiles and progressive penalties.
//!
//! Everything here is a pure function of its inputs. Counting requests and
//! violations is the job of [`super::CounterStore`].

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// How long an identity stays blacklisted once flagged.
pub const BLACKLIST_SECONDS: u64 = 24 * 60 * 60;

/// Violations are remembered for this long.
pub const VIOLATION_WINDOW_SECONDS: u64 = 24 * 60 * 60;

const MAX_PENALTY_MULTIPLIER: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    Login,
    Registration,
    PasswordReset,
    Read,
    Write,
    Upload,
    Search,
    Default,
}

impl EndpointCategory {
    pub const ALL: [Self; 8] = [
        Self::Login,
        Self::Registration,
        Self::PasswordReset,
        Self::Read,
        Self::Write,
        Self::Upload,
        Self::Search,
        Self::Default,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Registration => "registration",
            Self::PasswordReset => "password_reset",
            Self::Read => "read",
            Self::Write => "write",
            Self::Upload => "upload",
            Self::Search => "search",
            Self::Default => "default",
        }
    }

    /// Map a request path and HTTP method onto a category. Path keywords
    /// take precedence over the method.
    #[must_use]
    pub fn classify(path: &str, method: &str) -> Self {
        let path = path.to_ascii_lowercase();
        if path.contains("login") {
            Self::Login
        } else if path.contains("register") {
            Self::Registration
        } else if path.contains("password") || path.contains("reset") {
            Self::PasswordReset
        } else if path.contains("upload") {
            Self::Upload
        } else if path.contains("search") {
            Self::Search
        } else {
            match method.to_ascii_uppercase().as_str() {
                "POST" | "PUT" | "PATCH" | "DELETE" => Self::Write,
                "GET" => Self::Read,
                _ => Self::Default,
            }
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == wanted)
            .ok_or_else(|| format!("unknown endpoint category: {s}"))
    }
}

/// Caller classification, least to most generous (api keys aside).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Public,
    Basic,
    Premium,
    Enterprise,
    Admin,
    ApiKey,
}

/// What is known about a caller when picking its tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerProfile<'a> {
    pub is_superuser: bool,
    pub has_api_key: bool,
    pub subscription: Option<&'a str>,
}

impl Tier {
    pub const ALL: [Self; 6] = [
        Self::Public,
        Self::Basic,
        Self::Premium,
        Self::Enterprise,
        Self::Admin,
        Self::ApiKey,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
            Self::Admin => "admin",
            Self::ApiKey => "api-key",
        }
    }

    /// Anonymous callers are `Public`; authenticated callers default to `Basic`.
    #[must_use]
    pub fn for_caller(caller: Option<&CallerProfile<'_>>) -> Self {
        let Some(caller) = caller else {
            return Self::Public;
        };
        if caller.is_superuser {
            return Self::Admin;
        }
        if caller.has_api_key {
            return Self::ApiKey;
        }
        match caller.subscription.map(str::to_ascii_lowercase).as_deref() {
            Some("enterprise") => Self::Enterprise,
            Some("premium") => Self::Premium,
            _ => Self::Basic,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            "admin" => Ok(Self::Admin),
            "api-key" | "api_key" | "api" => Ok(Self::ApiKey),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Unrecognized names resolve to `Production`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Self::Development,
            "staging" | "stage" | "test" => Self::Staging,
            _ => Self::Production,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    #[must_use]
    pub const fn profile(self) -> EnvironmentProfile {
        match self {
            Self::Development => EnvironmentProfile {
                multiplier: 10,
                penalties_enabled: false,
                blacklist_enabled: false,
                max_violations_before_blacklist: 100,
            },
            Self::Staging => EnvironmentProfile {
                multiplier: 2,
                penalties_enabled: true,
                blacklist_enabled: true,
                max_violations_before_blacklist: 20,
            },
            Self::Production => EnvironmentProfile {
                multiplier: 1,
                penalties_enabled: true,
                blacklist_enabled: true,
                max_violations_before_blacklist: 10,
            },
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentProfile {
    pub multiplier: u32,
    pub penalties_enabled: bool,
    pub blacklist_enabled: bool,
    pub max_violations_before_blacklist: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub quota: u32,
    pub window_seconds: u64,
}

const fn rate(quota: u32, window_seconds: u64) -> RateLimit {
    RateLimit { quota, window_seconds }
}

/// Base quota before the environment multiplier. `None` means the category
/// has no entry for the tier and the public row applies.
const fn base_limit(category: EndpointCategory, tier: Tier) -> Option<RateLimit> {
    use EndpointCategory as C;
    use Tier as T;
    let limit = match (category, tier) {
        (C::Login, T::Public) => rate(5, 300),
        (C::Login, T::Basic) => rate(10, 300),
        (C::Login, T::Premium) => rate(20, 300),
        (C::Login, T::Enterprise) => rate(50, 300),
        (C::Login, T::Admin) => rate(100, 300),

        (C::Registration, T::Public) => rate(3, 3600),
        (C::Registration, T::Basic) => rate(5, 3600),
        (C::Registration, T::Premium) => rate(10, 3600),
        (C::Registration, T::Enterprise) => rate(50, 3600),
        (C::Registration, T::Admin) => rate(100, 3600),

        (C::PasswordReset, T::Public) => rate(3, 3600),
        (C::PasswordReset, T::Basic) => rate(5, 3600),
        (C::PasswordReset, T::Premium) => rate(10, 3600),
        (C::PasswordReset, T::Enterprise) => rate(20, 3600),
        (C::PasswordReset, T::Admin) => rate(50, 3600),

        (C::Read, T::Public) => rate(100, 3600),
        (C::Read, T::Basic) => rate(1000, 3600),
        (C::Read, T::Premium) => rate(5000, 3600),
        (C::Read, T::Enterprise) => rate(20_000, 3600),
        (C::Read, T::Admin) => rate(100_000, 3600),
        (C::Read, T::ApiKey) => rate(10_000, 3600),

        (C::Write, T::Public) => rate(10, 3600),
        (C::Write, T::Basic) => rate(100, 3600),
        (C::Write, T::Premium) => rate(500, 3600),
        (C::Write, T::Enterprise) => rate(2000, 3600),
        (C::Write, T::Admin) => rate(10_000, 3600),
        (C::Write, T::ApiKey) => rate(1000, 3600),

        (C::Upload, T::Public) => rate(5, 3600),
        (C::Upload, T::Basic) => rate(20, 3600),
        (C::Upload, T::Premium) => rate(100, 3600),
        (C::Upload, T::Enterprise) => rate(500, 3600),
        (C::Upload, T::Admin) => rate(1000, 3600),

        (C::Search, T::Public) => rate(30, 60),
        (C::Search, T::Basic) => rate(60, 60),
        (C::Search, T::Premium) => rate(120, 60),
        (C::Search, T::Enterprise) => rate(300, 60),
        (C::Search, T::Admin) => rate(1000, 60),

        (C::Default, T::Public) => rate(60, 60),
        (C::Default, T::Basic) => rate(120, 60),
        (C::Default, T::Premium) => rate(300, 60),
        (C::Default, T::Enterprise) => rate(600, 60),
        (C::Default, T::Admin) => rate(2000, 60),
        (C::Default, T::ApiKey) => rate(500, 60),

        _ => return None,
    };
    Some(limit)
}

/// Effective quota for a caller. The window is never scaled.
#[must_use]
pub fn limit_for(category: EndpointCategory, tier: Tier, environment: Environment) -> RateLimit {
    let base = base_limit(category, tier)
        .or_else(|| base_limit(category, Tier::Public))
        .unwrap_or(rate(60, 60));
    RateLimit {
        quota: base.quota.saturating_mul(environment.profile().multiplier),
        window_seconds: base.window_seconds,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Penalty {
    pub multiplier: u64,
    pub retry_after_seconds: u64,
    pub blacklist: bool,
}

/// Penalty for the `violations`-th violation (counting the current one) of
/// an identity against a limit. The first violation waits one window, each
/// later one doubles the wait up to eight windows.
#[must_use]
pub fn penalty_for(limit: RateLimit, violations: u64, environment: Environment) -> Penalty {
    let profile = environment.profile();
    let multiplier = if profile.penalties_enabled {
        let exponent = violations.saturating_sub(1).min(3);
        (1u64 << exponent).min(MAX_PENALTY_MULTIPLIER)
    } else {
        1
    };
    Penalty {
        multiplier,
        retry_after_seconds: limit.window_seconds.saturating_mul(multiplier),
        blacklist: profile.blacklist_enabled && violations >= profile.max_violations_before_blacklist,
    }
}

/// Message shown to a rate limited caller.
#[must_use]
pub fn message_for(category: EndpointCategory, tier: Tier, retry_after_seconds: u64) -> String {
    match (category, tier) {
        (EndpointCategory::Login, _) => {
            format!("Too many login attempts. Please try again in {retry_after_seconds} seconds.")
        }
        (EndpointCategory::Registration, _) => {
            format!("Registration limit reached. Please try again in {retry_after_seconds} seconds.")
        }
        (EndpointCategory::PasswordReset, _) => {
            format!("Too many password reset requests. Please try again in {retry_after_seconds} seconds.")
        }
        (_, Tier::Public) => {
            format!("Rate limit exceeded. Please sign in or try again in {retry_after_seconds} seconds.")
        }
        (_, Tier::Basic | Tier::Premium) => format!(
            "Rate limit exceeded. Consider upgrading your plan or try again in {retry_after_seconds} seconds."
        ),
        _ => format!("Rate limit exceeded. Please try again in {retry_after_seconds} seconds."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_basic_scales_with_environment() {
        let production = limit_for(EndpointCategory::Login, Tier::Basic, Environment::Production);
        assert_eq!(production, rate(10, 300));
        let development = limit_for(EndpointCategory::Login, Tier::Basic, Environment::Development);
        assert_eq!(development, rate(100, 300));
        let staging = limit_for(EndpointCategory::Login, Tier::Basic, Environment::Staging);
        assert_eq!(staging, rate(20, 300));
    }

    #[test]
    fn api_key_falls_back_to_public_row() {
        let limit = limit_for(EndpointCategory::Login, Tier::ApiKey, Environment::Production);
        assert_eq!(limit, rate(5, 300));
        let read = limit_for(EndpointCategory::Read, Tier::ApiKey, Environment::Production);
        assert_eq!(read, rate(10_000, 3600));
    }

    #[test]
    fn quotas_grow_with_tier() {
        for category in EndpointCategory::ALL {
            let quotas: Vec<u32> = [Tier::Public, Tier::Basic, Tier::Premium, Tier::Enterprise, Tier::Admin]
                .into_iter()
                .map(|tier| limit_for(category, tier, Environment::Production).quota)
                .collect();
            assert!(quotas.windows(2).all(|pair| pair[0] < pair[1]), "{category}");
        }
    }

    #[test]
    fn penalty_doubles_and_caps() {
        let limit = rate(5, 300);
        let waits: Vec<u64> = (1..=6)
            .map(|violations| penalty_for(limit, violations, Environment::Production).retry_after_seconds)
            .collect();
        assert_eq!(waits, vec![300, 600, 1200, 2400, 2400, 2400]);
    }

    #[test]
    fn blacklist_threshold_per_environment() {
        let limit = rate(5, 300);
        assert!(!penalty_for(limit, 9, Environment::Production).blacklist);
        assert!(penalty_for(limit, 10, Environment::Production).blacklist);
        assert!(!penalty_for(limit, 10, Environment::Staging).blacklist);
        assert!(penalty_for(limit, 20, Environment::Staging).blacklist);
        let dev = penalty_for(limit, 500, Environment::Development);
        assert!(!dev.blacklist);
        assert_eq!(dev.multiplier, 1);
    }

    #[test]
    fn environment_aliases() {
        assert_eq!(Environment::from_name("dev"), Environment::Development);
        assert_eq!(Environment::from_name("LOCAL"), Environment::Development);
        assert_eq!(Environment::from_name("test"), Environment::Staging);
        assert_eq!(Environment::from_name("stage"), Environment::Staging);
        assert_eq!(Environment::from_name("prod"), Environment::Production);
        assert_eq!(Environment::from_name(""), Environment::Production);
    }

    #[test]
    fn classify_paths() {
        assert_eq!(EndpointCategory::classify("/v1/auth/login", "POST"), EndpointCategory::Login);
        assert_eq!(EndpointCategory::classify("/v1/auth/register", "POST"), EndpointCategory::Registration);
        assert_eq!(
            EndpointCategory::classify("/v1/auth/password/forgot", "POST"),
            EndpointCategory::PasswordReset
        );
        assert_eq!(EndpointCategory::classify("/v1/files/upload", "POST"), EndpointCategory::Upload);
        assert_eq!(EndpointCategory::classify("/v1/search", "GET"), EndpointCategory::Search);
        assert_eq!(EndpointCategory::classify("/v1/posts", "delete"), EndpointCategory::Write);
        assert_eq!(EndpointCategory::classify("/v1/posts", "GET"), EndpointCategory::Read);
        assert_eq!(EndpointCategory::classify("/v1/posts", "OPTIONS"), EndpointCategory::Default);
    }

    #[test]
    fn tier_derivation() {
        assert_eq!(Tier::for_caller(None), Tier::Public);
        let admin = CallerProfile {
            is_superuser: true,
            has_api_key: true,
            ..CallerProfile::default()
        };
        assert_eq!(Tier::for_caller(Some(&admin)), Tier::Admin);
        let api = CallerProfile {
            has_api_key: true,
            ..CallerProfile::default()
        };
        assert_eq!(Tier::for_caller(Some(&api)), Tier::ApiKey);
        let premium = CallerProfile {
            subscription: Some("Premium"),
            ..CallerProfile::default()
        };
        assert_eq!(Tier::for_caller(Some(&premium)), Tier::Premium);
        assert_eq!(Tier::for_caller(Some(&CallerProfile::default())), Tier::Basic);
    }

    #[test]
    fn parse_names() {
        assert_eq!("api".parse::<Tier>(), Ok(Tier::ApiKey));
        assert_eq!("password-reset".parse::<EndpointCategory>(), Ok(EndpointCategory::PasswordReset));
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn messages_by_category_and_tier() {
        assert!(message_for(EndpointCategory::Login, Tier::Admin, 30).starts_with("Too many login attempts"));
        assert!(message_for(EndpointCategory::Read, Tier::Public, 30).contains("sign in"));
        assert!(message_for(EndpointCategory::Read, Tier::Premium, 30).contains("upgrading"));
        assert!(message_for(EndpointCategory::Read, Tier::Enterprise, 30).ends_with("30 seconds."));
    }
}
