use crate::cli::commands::rate_limit;
use crate::rate_limit::{limit_for, message_for, penalty_for, EndpointCategory, Tier};

#[derive(Debug)]
pub struct Args {
    pub category: EndpointCategory,
    pub tier: Tier,
    pub rate_limit: rate_limit::Options,
}

/// Lines printed by [`execute`].
#[must_use]
pub fn describe(args: &Args) -> Vec<String> {
    let environment = args.rate_limit.environment;
    let limit = limit_for(args.category, args.tier, environment);
    let profile = environment.profile();

    let mut lines = vec![
        format!("environment: {environment}"),
        format!("category:    {}", args.category),
        format!("tier:        {}", args.tier),
        format!("quota:       {} per {}s", limit.quota, limit.window_seconds),
    ];
    if profile.penalties_enabled {
        let first = penalty_for(limit, 1, environment);
        let worst = penalty_for(limit, profile.max_violations_before_blacklist, environment);
        lines.push(format!(
            "penalty:     retry after {}s, up to {}s",
            first.retry_after_seconds, worst.retry_after_seconds
        ));
    } else {
        lines.push("penalty:     disabled".to_string());
    }
    if profile.blacklist_enabled {
        lines.push(format!(
            "blacklist:   after {} violations",
            profile.max_violations_before_blacklist
        ));
    }
    lines.push(format!(
        "message:     {}",
        message_for(args.category, args.tier, limit.window_seconds)
    ));
    lines
}

pub fn execute(args: &Args) {
    for line in describe(args) {
        println!("{line}");
    }
}
