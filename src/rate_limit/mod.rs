//! Environment and tier aware rate limiting.

mod limiter;
mod policy;

pub use limiter::{
    CounterRateLimiter, CounterStore, NoopRateLimiter, RateLimitConfig, RateLimitDecision, RateLimiter,
};
pub use policy::{
    limit_for, message_for, penalty_for, CallerProfile, EndpointCategory, Environment, EnvironmentProfile, Penalty,
    RateLimit, Tier, BLACKLIST_SECONDS, VIOLATION_WINDOW_SECONDS,
};
