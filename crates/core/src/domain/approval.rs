use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::document::DocumentId;
use crate::domain::workflow::WorkflowId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "escalated" => Some(Self::Escalated),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Append-only decision log entry. Records are never mutated or removed;
/// step completion is always recomputed from this log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub step_order: u32,
    pub approver_id: String,
    pub decision: Decision,
    pub comment: Option<String>,
    #[serde(default)]
    pub condition_tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// The mutable aggregate root of one in-flight or completed approval.
/// Mutated only through the state machine; never deleted once terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub document_id: DocumentId,
    pub workflow_id: WorkflowId,
    pub current_step_order: u32,
    pub status: ApprovalStatus,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub records: Vec<ApprovalRecord>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn records_for_step(&self, step_order: u32) -> impl Iterator<Item = &ApprovalRecord> {
        self.records.iter().filter(move |record| record.step_order == step_order)
    }

    /// When the current step's timeout clock started: the latest record on
    /// the current step, else the latest record overall (the moment the
    /// previous step completed), else submission time.
    pub fn step_started_at(&self) -> DateTime<Utc> {
        self.records_for_step(self.current_step_order)
            .map(|record| record.recorded_at)
            .max()
            .or_else(|| self.records.iter().map(|record| record.recorded_at).max())
            .unwrap_or(self.submitted_at)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: String,
    pub approval_id: ApprovalId,
    pub delegated_by: String,
    pub delegated_to: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    /// A delegation grants acting rights only while active and unexpired.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// Audit-side record of a manual or automatic escalation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub approval_id: ApprovalId,
    pub escalated_by: String,
    pub escalated_to: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
