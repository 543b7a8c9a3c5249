//! Outbound user notifications (security alerts, password changes,
//! verification and reset links).
//!
//! Delivery is fire-and-forget: [`NotificationDispatcher::dispatch`] spawns the
//! send and only logs a failure. The default notifier for local dev is
//! [`LogNotifier`], which logs the recipient and template and never the
//! one-time token.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::events::SecurityEventKind;

#[derive(Clone, Debug)]
pub enum Notification {
    SecurityAlert {
        to_email: String,
        kind: SecurityEventKind,
    },
    PasswordChanged {
        to_email: String,
    },
    EmailVerification {
        to_email: String,
        token: SecretString,
    },
    PasswordReset {
        to_email: String,
        token: SecretString,
    },
}

impl Notification {
    #[must_use]
    pub fn template(&self) -> &'static str {
        match self {
            Self::SecurityAlert { .. } => "security_alert",
            Self::PasswordChanged { .. } => "password_changed",
            Self::EmailVerification { .. } => "verify_email",
            Self::PasswordReset { .. } => "password_reset",
        }
    }

    #[must_use]
    pub fn recipient(&self) -> &str {
        match self {
            Self::SecurityAlert { to_email, .. }
            | Self::PasswordChanged { to_email }
            | Self::EmailVerification { to_email, .. }
            | Self::PasswordReset { to_email, .. } => to_email,
        }
    }
}

/// Delivery abstraction for user notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification or return an error; the error is only logged.
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Local dev notifier that logs instead of delivering.
#[derive(Clone, Debug)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            to_email = %notification.recipient(),
            template = %notification.template(),
            "notification send stub"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Spawn delivery and return immediately.
    pub fn dispatch(&self, notification: Notification) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(err) = notifier.send(&notification).await {
                error!(
                    template = %notification.template(),
                    "Failed to send notification: {err:#}"
                );
            }
        })
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().unwrap().push(notification.template());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn send(&self, _notification: &Notification) -> Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_in_background() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = NotificationDispatcher::new(recorder.clone());
        dispatcher
            .dispatch(Notification::PasswordChanged {
                to_email: "alice@example.com".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(*recorder.sent.lock().unwrap(), vec!["password_changed"]);
    }

    #[tokio::test]
    async fn dispatch_swallows_delivery_errors() {
        let dispatcher = NotificationDispatcher::new(Arc::new(Broken));
        let handle = dispatcher.dispatch(Notification::SecurityAlert {
            to_email: "alice@example.com".to_string(),
            kind: SecurityEventKind::HijackSuspected,
        });
        assert!(handle.await.is_ok());
    }

    #[test]
    fn debug_does_not_leak_tokens() {
        let notification = Notification::PasswordReset {
            to_email: "alice@example.com".to_string(),
            token: SecretString::from("raw-reset-token".to_string()),
        };
        let rendered = format!("{notification:?}");
        assert!(!rendered.contains("raw-reset-token"));
        assert_eq!(notification.recipient(), "alice@example.com");
    }
}
