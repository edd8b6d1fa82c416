use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequest,
    ApprovalRejected,
    ApprovalComplete,
    ApprovalDelegated,
    ApprovalEscalated,
    ApprovalTimeout,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApprovalRequest => "approval_request",
            Self::ApprovalRejected => "approval_rejected",
            Self::ApprovalComplete => "approval_complete",
            Self::ApprovalDelegated => "approval_delegated",
            Self::ApprovalEscalated => "approval_escalated",
            Self::ApprovalTimeout => "approval_timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            title: title.into(),
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Outbound notification delivery. Fire-and-forget: an approval must never
/// be blocked by a notification outage, so implementations absorb and log
/// their own failures.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotificationSink {
    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, notification: Notification) {
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}

/// Delivery via the tracing subscriber, for operator tooling without a real
/// notification channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notification: Notification) {
        tracing::info!(
            user_id = %notification.user_id,
            kind = notification.kind.as_str(),
            title = %notification.title,
            "notification dispatched"
        );
    }
}
