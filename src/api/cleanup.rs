//! Periodic removal of expired sessions and refresh tokens.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::auth::AuthService;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Spawn the worker. The first pass runs one `interval` after start.
pub fn spawn(auth: Arc<AuthService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match auth.purge_expired().await {
                Ok((sessions, refresh_tokens)) => {
                    debug!(sessions, refresh_tokens, "Cleanup pass finished");
                }
                Err(err) => error!("Cleanup pass failed: {err}"),
            }
        }
    })
}
