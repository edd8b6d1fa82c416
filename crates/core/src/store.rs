use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus, Delegation, Escalation};
use crate::domain::document::DocumentId;
use crate::domain::workflow::{WorkflowId, WorkflowTemplate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Read/write access to workflow templates. The engine reads templates at
/// approval time and never mutates them; the write side serves template
/// authors (CLI, seeding, tests).
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn templates_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<WorkflowTemplate>, StoreError>;

    async fn template(&self, id: &WorkflowId) -> Result<Option<WorkflowTemplate>, StoreError>;

    /// Upsert a template. Implementations must keep at most one default
    /// template per owner: saving a default clears the flag on the others.
    async fn save_template(&self, template: WorkflowTemplate) -> Result<(), StoreError>;

    async fn delete_template(&self, id: &WorkflowId) -> Result<(), StoreError>;
}

/// Persistence for approval requests and their side relations.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn approval(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError>;

    async fn find_pending_for_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<ApprovalRequest>, StoreError>;

    /// The authoritative write: persists the request row and appends any
    /// records not yet stored. Appends must be idempotent by record id so a
    /// retried save never double-applies a decision.
    async fn save(&self, request: ApprovalRequest) -> Result<(), StoreError>;

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// An approver's queue: pending requests where the user is listed on the
    /// current step or holds an effective delegation for the request.
    async fn list_pending_for_approver(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApprovalRequest>, StoreError>;

    async fn create_delegation(&self, delegation: Delegation) -> Result<(), StoreError>;

    async fn delegations_for_approval(
        &self,
        id: &ApprovalId,
    ) -> Result<Vec<Delegation>, StoreError>;

    async fn create_escalation(&self, escalation: Escalation) -> Result<(), StoreError>;
}

/// In-memory store used in tests and as the reference semantics for SQL
/// implementations.
#[derive(Default)]
pub struct InMemoryStore {
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
    approvals: RwLock<HashMap<String, ApprovalRequest>>,
    delegations: RwLock<Vec<Delegation>>,
    escalations: RwLock<Vec<Escalation>>,
}

impl InMemoryStore {
    pub async fn escalations(&self) -> Vec<Escalation> {
        self.escalations.read().await.clone()
    }

    pub async fn delegations(&self) -> Vec<Delegation> {
        self.delegations.read().await.clone()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn templates_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<WorkflowTemplate>, StoreError> {
        let templates = self.templates.read().await;
        let mut owned: Vec<WorkflowTemplate> =
            templates.values().filter(|template| template.owner_id == owner_id).cloned().collect();
        owned.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(owned)
    }

    async fn template(&self, id: &WorkflowId) -> Result<Option<WorkflowTemplate>, StoreError> {
        let templates = self.templates.read().await;
        Ok(templates.get(&id.0).cloned())
    }

    async fn save_template(&self, template: WorkflowTemplate) -> Result<(), StoreError> {
        let mut templates = self.templates.write().await;
        if template.is_default {
            for other in templates.values_mut() {
                if other.owner_id == template.owner_id && other.id != template.id {
                    other.is_default = false;
                }
            }
        }
        templates.insert(template.id.0.clone(), template);
        Ok(())
    }

    async fn delete_template(&self, id: &WorkflowId) -> Result<(), StoreError> {
        let mut templates = self.templates.write().await;
        templates.remove(&id.0);
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for InMemoryStore {
    async fn approval(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError> {
        let approvals = self.approvals.read().await;
        Ok(approvals.get(&id.0).cloned())
    }

    async fn find_pending_for_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .values()
            .find(|request| {
                request.document_id == *document_id && request.status == ApprovalStatus::Pending
            })
            .cloned())
    }

    async fn save(&self, request: ApprovalRequest) -> Result<(), StoreError> {
        let mut approvals = self.approvals.write().await;
        approvals.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let approvals = self.approvals.read().await;
        let mut pending: Vec<ApprovalRequest> = approvals
            .values()
            .filter(|request| request.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|left, right| left.submitted_at.cmp(&right.submitted_at));
        Ok(pending)
    }

    async fn list_pending_for_approver(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let now = Utc::now();
        let pending = self.list_pending().await?;
        let templates = self.templates.read().await;
        let delegations = self.delegations.read().await;

        Ok(pending
            .into_iter()
            .filter(|request| {
                let direct = templates
                    .get(&request.workflow_id.0)
                    .and_then(|template| template.step(request.current_step_order))
                    .is_some_and(|step| step.approver_ids.iter().any(|id| id == user_id));
                let delegated = delegations.iter().any(|delegation| {
                    delegation.approval_id == request.id
                        && delegation.delegated_to == user_id
                        && delegation.is_effective(now)
                });
                direct || delegated
            })
            .collect())
    }

    async fn create_delegation(&self, delegation: Delegation) -> Result<(), StoreError> {
        let mut delegations = self.delegations.write().await;
        delegations.push(delegation);
        Ok(())
    }

    async fn delegations_for_approval(
        &self,
        id: &ApprovalId,
    ) -> Result<Vec<Delegation>, StoreError> {
        let delegations = self.delegations.read().await;
        Ok(delegations.iter().filter(|delegation| delegation.approval_id == *id).cloned().collect())
    }

    async fn create_escalation(&self, escalation: Escalation) -> Result<(), StoreError> {
        let mut escalations = self.escalations.write().await;
        escalations.push(escalation);
        Ok(())
    }
}
