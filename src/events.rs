//! Security events and the sinks they are fanned out to.
//!
//! Events are append-only. The registry keeps a bounded in-process journal
//! (most recent first to go) and forwards every event to the sinks that were
//! registered at startup. A failing sink is logged and skipped; it never
//! fails the flow that raised the event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::PrivilegeLevel;

const JOURNAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    FixationAttempt,
    HijackSuspected,
    PrivilegeEscalation,
    ConcurrentSessionEviction,
    AccountLocked,
    RefreshTokenReuse,
}

impl SecurityEventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FixationAttempt => "fixation_attempt",
            Self::HijackSuspected => "hijack_suspected",
            Self::PrivilegeEscalation => "privilege_escalation",
            Self::ConcurrentSessionEviction => "concurrent_session_eviction",
            Self::AccountLocked => "account_locked",
            Self::RefreshTokenReuse => "refresh_token_reuse",
        }
    }
}

/// What differed between a session's recorded origin and the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMismatch {
    Ip,
    ClientSignature,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityEventDetail {
    FixationAttempt {
        session: String,
        ip: String,
    },
    HijackSuspected {
        session: String,
        mismatch: BindingMismatch,
        ip: String,
    },
    PrivilegeEscalation {
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        current: PrivilegeLevel,
        requested: PrivilegeLevel,
    },
    ConcurrentSessionEviction {
        evicted: usize,
        ceiling: usize,
    },
    AccountLocked {
        failed_attempts: u32,
        locked_until: DateTime<Utc>,
    },
    RefreshTokenReuse {
        session: String,
        revoked_tokens: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: SecurityEventDetail,
}

impl SecurityEvent {
    #[must_use]
    pub fn new(principal_id: Option<Uuid>, occurred_at: DateTime<Utc>, detail: SecurityEventDetail) -> Self {
        Self {
            principal_id,
            occurred_at,
            detail,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SecurityEventKind {
        match self.detail {
            SecurityEventDetail::FixationAttempt { .. } => SecurityEventKind::FixationAttempt,
            SecurityEventDetail::HijackSuspected { .. } => SecurityEventKind::HijackSuspected,
            SecurityEventDetail::PrivilegeEscalation { .. } => SecurityEventKind::PrivilegeEscalation,
            SecurityEventDetail::ConcurrentSessionEviction { .. } => {
                SecurityEventKind::ConcurrentSessionEviction
            }
            SecurityEventDetail::AccountLocked { .. } => SecurityEventKind::AccountLocked,
            SecurityEventDetail::RefreshTokenReuse { .. } => SecurityEventKind::RefreshTokenReuse,
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError>;
}

/// Writes events to the log at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        let detail = serde_json::to_string(&event.detail)
            .map_err(|err| StoreError::Unavailable(format!("event encoding failed: {err}")))?;
        warn!(
            security_event = event.kind().as_str(),
            principal_id = ?event.principal_id,
            occurred_at = %event.occurred_at,
            detail = %detail,
            "Security event"
        );
        Ok(())
    }
}

/// Keeps every recorded event in memory. Used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

pub struct EventRegistry {
    sinks: Vec<Arc<dyn EventSink>>,
    journal: Mutex<VecDeque<SecurityEvent>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            journal: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn emit(&self, event: SecurityEvent) {
        {
            let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
            if journal.len() == JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(event.clone());
        }
        for sink in &self.sinks {
            if let Err(err) = sink.record(&event).await {
                warn!(
                    security_event = event.kind().as_str(),
                    "Failed to record security event: {err}"
                );
            }
        }
    }

    /// Snapshot of the in-process journal, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new().with_sink(Arc::new(TracingEventSink))
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn record(&self, _event: &SecurityEvent) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("sink offline".to_string()))
        }
    }

    fn locked_event() -> SecurityEvent {
        let now = Utc::now();
        SecurityEvent::new(
            Some(Uuid::new_v4()),
            now,
            SecurityEventDetail::AccountLocked {
                failed_attempts: 5,
                locked_until: now,
            },
        )
    }

    #[tokio::test]
    async fn emit_fans_out_and_survives_failing_sinks() {
        let memory = Arc::new(MemoryEventSink::new());
        let registry = EventRegistry::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());

        registry.emit(locked_event()).await;

        assert_eq!(memory.events().len(), 1);
        assert_eq!(registry.events().len(), 1);
        assert_eq!(registry.events()[0].kind(), SecurityEventKind::AccountLocked);
    }

    #[tokio::test]
    async fn journal_is_bounded() {
        let registry = EventRegistry::new();
        for _ in 0..(JOURNAL_CAPACITY + 3) {
            registry.emit(locked_event()).await;
        }
        assert_eq!(registry.events().len(), JOURNAL_CAPACITY);
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = SecurityEvent::new(
            None,
            Utc::now(),
            SecurityEventDetail::ConcurrentSessionEviction {
                evicted: 2,
                ceiling: 5,
            },
        );
        let value = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(value["kind"], "concurrent_session_eviction");
        assert_eq!(value["evicted"], 2);
        assert!(value.get("principal_id").is_none());
    }
}
