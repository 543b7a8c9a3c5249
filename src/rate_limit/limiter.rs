use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::policy::{
    limit_for, penalty_for, EndpointCategory, Environment, Tier, BLACKLIST_SECONDS, VIOLATION_WINDOW_SECONDS,
};
use crate::error::{AuthError, StoreError};

/// Shared fixed-window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key` and return the new value. A key whose
    /// window has elapsed starts over at 1 with a fresh window.
    async fn increment_and_get(&self, key: &str, window_seconds: u64) -> Result<u64, StoreError>;

    /// Current value, 0 when absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    async fn increment_and_get(&self, key: &str, window_seconds: u64) -> Result<u64, StoreError> {
        (**self).increment_and_get(key, window_seconds).await
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        (**self).get(key).await
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    environment: Environment,
    enabled: bool,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(Environment::Production)
    }
}

/// An admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub quota: u32,
    pub remaining: u32,
    pub window_seconds: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// # Errors
    /// `RateLimitExceeded` when the identity is over quota or blacklisted,
    /// `DependencyUnavailable` when the counter store fails.
    async fn check(
        &self,
        category: EndpointCategory,
        tier: Tier,
        identity: &str,
    ) -> Result<RateLimitDecision, AuthError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(
        &self,
        _category: EndpointCategory,
        _tier: Tier,
        _identity: &str,
    ) -> Result<RateLimitDecision, AuthError> {
        Ok(RateLimitDecision {
            quota: u32::MAX,
            remaining: u32::MAX,
            window_seconds: 0,
        })
    }
}

fn counter_key(category: EndpointCategory, identity: &str) -> String {
    format!("rl:{category}:{identity}")
}

fn violation_key(category: EndpointCategory, identity: &str) -> String {
    format!("rlv:{category}:{identity}")
}

fn blacklist_key(identity: &str) -> String {
    format!("rlb:{identity}")
}

pub struct CounterRateLimiter<S> {
    store: S,
    config: RateLimitConfig,
}

impl<S: CounterStore> CounterRateLimiter<S> {
    #[must_use]
    pub fn new(store: S, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[async_trait]
impl<S: CounterStore> RateLimiter for CounterRateLimiter<S> {
    async fn check(
        &self,
        category: EndpointCategory,
        tier: Tier,
        identity: &str,
    ) -> Result<RateLimitDecision, AuthError> {
        let environment = self.config.environment;
        let limit = limit_for(category, tier, environment);
        if !self.config.enabled {
            return Ok(RateLimitDecision {
                quota: limit.quota,
                remaining: limit.quota,
                window_seconds: limit.window_seconds,
            });
        }

        let profile = environment.profile();
        if profile.blacklist_enabled && self.store.get(&blacklist_key(identity)).await? > 0 {
            debug!(identity, %category, "Request from blacklisted identity");
            return Err(AuthError::RateLimitExceeded {
                retry_after_seconds: BLACKLIST_SECONDS,
                tier,
                blacklisted: true,
            });
        }

        let count = self
            .store
            .increment_and_get(&counter_key(category, identity), limit.window_seconds)
            .await?;
        if count <= u64::from(limit.quota) {
            let remaining = u64::from(limit.quota) - count;
            return Ok(RateLimitDecision {
                quota: limit.quota,
                remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
                window_seconds: limit.window_seconds,
            });
        }

        let violations = if profile.penalties_enabled {
            self.store
                .increment_and_get(&violation_key(category, identity), VIOLATION_WINDOW_SECONDS)
                .await?
        } else {
            1
        };
        let penalty = penalty_for(limit, violations, environment);
        if penalty.blacklist {
            self.store
                .increment_and_get(&blacklist_key(identity), BLACKLIST_SECONDS)
                .await?;
            warn!(identity, %category, violations, "Identity blacklisted after repeated rate limit violations");
        } else {
            debug!(
                identity,
                %category,
                %tier,
                violations,
                multiplier = penalty.multiplier,
                "Rate limit exceeded"
            );
        }
        Err(AuthError::RateLimitExceeded {
            retry_after_seconds: penalty.retry_after_seconds,
            tier,
            blacklisted: penalty.blacklist,
        })
    }
}
