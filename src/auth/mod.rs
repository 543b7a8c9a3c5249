//! The authentication orchestrator and the collaborators it is built from.

mod orchestrator;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;
use crate::events::{EventSink, SecurityEvent, SecurityEventKind};
use crate::notify::{Notification, NotificationDispatcher};
use crate::permission::RoleStore;
use crate::principal::{OneTimeTokenStore, PrincipalStore};
use crate::session::SessionStore;
use crate::token::RefreshTokenStore;

pub use orchestrator::{AuthService, AuthServiceBuilder};
pub use types::{
    AuthConfig, LoginOutcome, LoginRequest, LogoutOutcome, LogoutScope, PasswordResetReceipt,
    RegistrationReceipt,
};

/// Persistence the orchestrator needs, one handle per boundary.
#[derive(Clone)]
pub struct AuthStores {
    pub principals: Arc<dyn PrincipalStore>,
    pub one_time_tokens: Arc<dyn OneTimeTokenStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub roles: Arc<dyn RoleStore>,
}

impl std::fmt::Debug for AuthStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStores").finish_non_exhaustive()
    }
}

/// Turns security events that concern an account holder into alerts.
pub(crate) struct SecurityAlertSink {
    principals: Arc<dyn PrincipalStore>,
    notifications: NotificationDispatcher,
}

impl SecurityAlertSink {
    pub(crate) fn new(principals: Arc<dyn PrincipalStore>, notifications: NotificationDispatcher) -> Self {
        Self {
            principals,
            notifications,
        }
    }
}

#[async_trait]
impl EventSink for SecurityAlertSink {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        let kind = event.kind();
        if !matches!(
            kind,
            SecurityEventKind::AccountLocked
                | SecurityEventKind::HijackSuspected
                | SecurityEventKind::RefreshTokenReuse
        ) {
            return Ok(());
        }
        let Some(principal_id) = event.principal_id else {
            return Ok(());
        };
        let Some(principal) = self.principals.find_by_id(principal_id).await? else {
            debug!(principal_id = %principal_id, "Alert skipped, principal gone");
            return Ok(());
        };
        self.notifications.dispatch(Notification::SecurityAlert {
            to_email: principal.email,
            kind,
        });
        Ok(())
    }
}
