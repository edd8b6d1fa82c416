use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

/// A trigger or step condition over a document. The set is closed: unknown
/// types cannot appear because the enum is the wire format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    ValueAbove { value: Decimal },
    ValueBelow { value: Decimal },
    ValueBetween { min_value: Decimal, max_value: Decimal },
    ClientType { value: String },
    Category { value: String },
    DiscountAbove { value: Decimal },
    CustomField { field: String, value: String },
}

/// How a step is considered complete. The source modeled this as two
/// mutually exclusive fields; a closed enum makes the exclusivity structural.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CompletionRule {
    AllApprovers,
    Quorum { required: u32 },
}

impl Default for CompletionRule {
    fn default() -> Self {
        Self::Quorum { required: 1 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationAction {
    Notify,
    Reassign,
    AutoApprove,
    AutoReject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub action: EscalationAction,
    /// Target user for `Reassign`; unused for the other actions.
    pub escalate_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position, unique within a template.
    pub order: u32,
    pub name: String,
    pub approver_ids: Vec<String>,
    #[serde(default)]
    pub completion: CompletionRule,
    pub timeout_hours: Option<i64>,
    pub escalation: Option<EscalationPolicy>,
    /// Step-level applicability conditions. Carried and validated but not
    /// evaluated by the engine; whether unmatched conditions skip the step
    /// is a pending product decision.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Step {
    /// Number of distinct approvals needed to complete this step.
    pub fn required_approvals(&self) -> usize {
        match self.completion {
            CompletionRule::AllApprovers => self.approver_ids.len(),
            CompletionRule::Quorum { required } => required as usize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: WorkflowId,
    pub owner_id: String,
    pub name: String,
    pub is_default: bool,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub trigger_conditions: Vec<Condition>,
    pub min_value: Option<Decimal>,
    pub max_value: Option<Decimal>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    pub fn step(&self, order: u32) -> Option<&Step> {
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn last_step_order(&self) -> u32 {
        self.steps.iter().map(|step| step.order).max().unwrap_or(0)
    }
}
