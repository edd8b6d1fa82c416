use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::approval::ApprovalId;

/// Lifecycle actions emitted by the state machine, one per audit entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Submitted,
    StepApproved,
    PartialApproval,
    Approved,
    Rejected,
    Delegated,
    Escalated,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::StepApproved => "STEP_APPROVED",
            Self::PartialApproval => "PARTIAL_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Delegated => "DELEGATED",
            Self::Escalated => "ESCALATED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub approval_id: ApprovalId,
    pub actor_id: String,
    pub action: AuditAction,
    pub details: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        approval_id: ApprovalId,
        actor_id: impl Into<String>,
        action: AuditAction,
        details: Option<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            approval_id,
            actor_id: actor_id.into(),
            action,
            details,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only audit stream. Implementations are fire-and-forget: a sink
/// failure must be absorbed (and logged) inside the implementation, never
/// surfaced to the state machine.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Sink that forwards audit entries to the tracing subscriber. Used by the
/// CLI sweep path where no audit table is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            approval_id = %entry.approval_id.0,
            actor_id = %entry.actor_id,
            action = entry.action.as_str(),
            details = entry.details.as_deref().unwrap_or(""),
            "audit entry recorded"
        );
    }
}
