use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditSink};
use crate::domain::approval::{
    ApprovalId, ApprovalRecord, ApprovalRequest, ApprovalStatus, Decision, Delegation, Escalation,
};
use crate::domain::document::Document;
use crate::domain::workflow::{EscalationAction, Step, WorkflowId, WorkflowTemplate};
use crate::errors::EngineError;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::store::{ApprovalStore, WorkflowStore};
use crate::validation::validate_template;

pub const SYSTEM_ACTOR: &str = "system";

/// How duplicate approvals from one approver count toward a step's quorum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumCounting {
    /// Each approver counts once no matter how many times they approve.
    #[default]
    DistinctApprovers,
    /// Every approval record counts, duplicates included.
    RawRecords,
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Reserved actor identifier for automated timeout actions. Bypasses
    /// the approver/delegation authorization check by a dedicated path.
    pub system_actor: String,
    pub quorum_counting: QuorumCounting,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { system_actor: SYSTEM_ACTOR.to_string(), quorum_counting: QuorumCounting::default() }
    }
}

/// Result of an `act` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActOutcome {
    Rejected,
    /// The record was appended but the step still needs more approvals.
    PartialApproval { approvals: usize, required: usize },
    AdvancedToStep { next_order: u32 },
    Approved,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Notified,
    Escalated,
    Acted(ActOutcome),
}

/// Per-approval serialization. Two concurrent operations on the same
/// approval must not interleave their read-modify-write cycles; operations
/// on different approvals proceed in parallel.
#[derive(Default)]
struct LockRegistry {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockRegistry {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// The approval state machine. Stateless between calls: every operation
/// reads the request fresh from the store and writes it back under the
/// per-approval lock. Notification and audit emission happen after the
/// authoritative write; their sinks are fire-and-forget.
pub struct ApprovalEngine<S, N, A> {
    store: Arc<S>,
    notifications: N,
    audit: A,
    options: EngineOptions,
    locks: LockRegistry,
}

impl<S, N, A> ApprovalEngine<S, N, A>
where
    S: WorkflowStore + ApprovalStore,
    N: NotificationSink,
    A: AuditSink,
{
    pub fn new(store: Arc<S>, notifications: N, audit: A, options: EngineOptions) -> Self {
        Self { store, notifications, audit, options, locks: LockRegistry::default() }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate and persist a workflow template.
    pub async fn save_template(&self, template: WorkflowTemplate) -> Result<(), EngineError> {
        if let Err(error) = validate_template(&template) {
            tracing::error!(workflow_id = %template.id.0, %error, "rejected invalid template");
            return Err(error);
        }
        self.store.save_template(template).await?;
        Ok(())
    }

    /// Delete a template. Refused while any pending request references it;
    /// completed requests keep their reference for audit history.
    pub async fn delete_template(&self, id: &WorkflowId) -> Result<(), EngineError> {
        let pending = self.store.list_pending().await?;
        if pending.iter().any(|request| request.workflow_id == *id) {
            return Err(EngineError::Conflict(format!(
                "workflow `{}` has pending approval requests",
                id.0
            )));
        }
        self.store.delete_template(id).await?;
        Ok(())
    }

    /// Create an approval request for a document at step 1 of the template.
    pub async fn submit(
        &self,
        document: &Document,
        template: &WorkflowTemplate,
        submitted_by: &str,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, EngineError> {
        let lock = self.locks.lock_for(&format!("doc/{}", document.id.0));
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.find_pending_for_document(&document.id).await? {
            return Err(EngineError::Conflict(format!(
                "document `{}` already has pending approval `{}`",
                document.id.0, existing.id.0
            )));
        }

        let first_step = template.step(1).ok_or_else(|| {
            tracing::error!(workflow_id = %template.id.0, "template has no step 1");
            EngineError::InvalidRequest(format!("workflow `{}` has no step 1", template.id.0))
        })?;

        let request = ApprovalRequest {
            id: ApprovalId(Uuid::new_v4().to_string()),
            document_id: document.id.clone(),
            workflow_id: template.id.clone(),
            current_step_order: 1,
            status: ApprovalStatus::Pending,
            submitted_by: submitted_by.to_string(),
            submitted_at: Utc::now(),
            notes,
            records: Vec::new(),
            completed_at: None,
        };
        self.store.save(request.clone()).await?;

        self.audit.record(AuditEntry::new(
            request.id.clone(),
            submitted_by,
            AuditAction::Submitted,
            Some(format!("document `{}` entered step 1", document.id.0)),
        ));
        self.notify_step_approvers(
            &request,
            first_step,
            NotificationKind::ApprovalRequest,
            "Approval needed",
            &format!("Document `{}` awaits your approval at step `{}`", document.id.0, first_step.name),
        );

        Ok(request)
    }

    /// Apply one approver decision to a pending request.
    pub async fn act(
        &self,
        approval_id: &ApprovalId,
        actor: &str,
        decision: Decision,
        comment: Option<String>,
        condition_tags: Vec<String>,
    ) -> Result<ActOutcome, EngineError> {
        let lock = self.locks.lock_for(&format!("apr/{}", approval_id.0));
        let _guard = lock.lock().await;

        let mut request = self.load(approval_id).await?;
        if request.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "approval `{}` is not pending",
                approval_id.0
            )));
        }

        let template = self.template_for(&request).await?;
        let step = self.current_step(&template, &request)?;

        self.authorize(&request, step, actor).await?;

        // The record is appended before branching on the decision so the log
        // retains the full history even for a rejection.
        request.records.push(ApprovalRecord {
            id: Uuid::new_v4().to_string(),
            step_order: request.current_step_order,
            approver_id: actor.to_string(),
            decision,
            comment: comment.clone(),
            condition_tags,
            recorded_at: Utc::now(),
        });

        match decision {
            Decision::Rejected => {
                // First rejection wins: a single reject at any step is
                // terminal regardless of quorum rules or earlier steps.
                request.status = ApprovalStatus::Rejected;
                request.completed_at = Some(Utc::now());
                self.store.save(request.clone()).await?;

                self.audit.record(AuditEntry::new(
                    request.id.clone(),
                    actor,
                    AuditAction::Rejected,
                    comment,
                ));
                self.notifications.notify(
                    Notification::new(
                        &request.submitted_by,
                        NotificationKind::ApprovalRejected,
                        "Approval rejected",
                        format!("Document `{}` was rejected", request.document_id.0),
                    )
                    .with_context("approval_id", &request.id.0),
                );
                Ok(ActOutcome::Rejected)
            }
            Decision::Approved => self.advance_after_approval(request, &template, step, actor).await,
        }
    }

    async fn advance_after_approval(
        &self,
        mut request: ApprovalRequest,
        template: &WorkflowTemplate,
        step: &Step,
        actor: &str,
    ) -> Result<ActOutcome, EngineError> {
        let approvals = self.approval_count(&request, step.order);
        let required = step.required_approvals();

        // The system pseudo-actor's approval completes the step outright:
        // the auto-approve timeout posts one synthetic record and must not
        // leave the request parked at a partial quorum, where every later
        // sweep would append another partial record.
        let quorum_met = approvals >= required || actor == self.options.system_actor;

        if !quorum_met {
            self.store.save(request.clone()).await?;
            self.audit.record(AuditEntry::new(
                request.id.clone(),
                actor,
                AuditAction::PartialApproval,
                Some(format!("step {}: {approvals} of {required} approvals", step.order)),
            ));
            return Ok(ActOutcome::PartialApproval { approvals, required });
        }

        match template.step(request.current_step_order + 1) {
            Some(next_step) => {
                request.current_step_order += 1;
                self.store.save(request.clone()).await?;

                self.audit.record(AuditEntry::new(
                    request.id.clone(),
                    actor,
                    AuditAction::StepApproved,
                    Some(format!("advanced to step {}", next_step.order)),
                ));
                self.notify_step_approvers(
                    &request,
                    next_step,
                    NotificationKind::ApprovalRequest,
                    "Approval needed",
                    &format!(
                        "Document `{}` awaits your approval at step `{}`",
                        request.document_id.0, next_step.name
                    ),
                );
                Ok(ActOutcome::AdvancedToStep { next_order: request.current_step_order })
            }
            None => {
                request.status = ApprovalStatus::Approved;
                request.completed_at = Some(Utc::now());
                self.store.save(request.clone()).await?;

                self.audit.record(AuditEntry::new(
                    request.id.clone(),
                    actor,
                    AuditAction::Approved,
                    None,
                ));
                self.notifications.notify(
                    Notification::new(
                        &request.submitted_by,
                        NotificationKind::ApprovalComplete,
                        "Approval complete",
                        format!("Document `{}` passed all approval steps", request.document_id.0),
                    )
                    .with_context("approval_id", &request.id.0),
                );
                Ok(ActOutcome::Approved)
            }
        }
    }

    /// Grant an approver's acting rights for the current step to another
    /// user, optionally for a bounded number of hours.
    pub async fn delegate(
        &self,
        approval_id: &ApprovalId,
        delegator: &str,
        delegate_to: &str,
        reason: Option<String>,
        expires_in_hours: Option<i64>,
    ) -> Result<Delegation, EngineError> {
        let lock = self.locks.lock_for(&format!("apr/{}", approval_id.0));
        let _guard = lock.lock().await;

        let request = self.load(approval_id).await?;
        if request.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "approval `{}` is not pending",
                approval_id.0
            )));
        }

        let template = self.template_for(&request).await?;
        let step = self.current_step(&template, &request)?;
        if !step.approver_ids.iter().any(|id| id == delegator) {
            return Err(EngineError::Forbidden(format!(
                "`{delegator}` is not an approver of step {}",
                step.order
            )));
        }

        let delegation = Delegation {
            id: Uuid::new_v4().to_string(),
            approval_id: approval_id.clone(),
            delegated_by: delegator.to_string(),
            delegated_to: delegate_to.to_string(),
            reason: reason.clone(),
            expires_at: expires_in_hours.map(|hours| Utc::now() + Duration::hours(hours)),
            is_active: true,
            created_at: Utc::now(),
        };
        self.store.create_delegation(delegation.clone()).await?;

        self.audit.record(AuditEntry::new(
            approval_id.clone(),
            delegator,
            AuditAction::Delegated,
            Some(format!("delegated to `{delegate_to}`")),
        ));
        self.notifications.notify(
            Notification::new(
                delegate_to,
                NotificationKind::ApprovalDelegated,
                "Approval delegated to you",
                format!(
                    "`{delegator}` delegated their approval of document `{}` to you",
                    request.document_id.0
                ),
            )
            .with_context("approval_id", &approval_id.0),
        );
        Ok(delegation)
    }

    /// Redirect an approval to a different responsible party, outside the
    /// normal step sequence. Deliberately permissive: any status, no
    /// step-ownership check, because the timeout path escalates as the
    /// system pseudo-actor. Forces the request out of `Pending`, so an
    /// escalated request is no longer actionable until resubmitted.
    pub async fn escalate(
        &self,
        approval_id: &ApprovalId,
        escalated_by: &str,
        escalate_to: &str,
        reason: Option<String>,
    ) -> Result<Escalation, EngineError> {
        let lock = self.locks.lock_for(&format!("apr/{}", approval_id.0));
        let _guard = lock.lock().await;

        let mut request = self.load(approval_id).await?;

        let escalation = Escalation {
            id: Uuid::new_v4().to_string(),
            approval_id: approval_id.clone(),
            escalated_by: escalated_by.to_string(),
            escalated_to: escalate_to.to_string(),
            reason: reason.clone(),
            created_at: Utc::now(),
        };
        self.store.create_escalation(escalation.clone()).await?;

        request.status = ApprovalStatus::Escalated;
        self.store.save(request.clone()).await?;

        self.audit.record(AuditEntry::new(
            approval_id.clone(),
            escalated_by,
            AuditAction::Escalated,
            reason,
        ));
        self.notifications.notify(
            Notification::new(
                escalate_to,
                NotificationKind::ApprovalEscalated,
                "Approval escalated to you",
                format!("Document `{}` was escalated to you", request.document_id.0),
            )
            .with_context("approval_id", &approval_id.0),
        );
        Ok(escalation)
    }

    /// Apply the current step's escalation policy after its deadline
    /// passed. Invoked by the timeout scheduler; takes no lock itself, the
    /// inner `act`/`escalate` calls re-validate status under the lock, so a
    /// human decision racing the deadline wins cleanly.
    pub async fn handle_timeout(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<TimeoutOutcome, EngineError> {
        let request = self.load(approval_id).await?;
        if request.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "approval `{}` is not pending",
                approval_id.0
            )));
        }

        let template = self.template_for(&request).await?;
        let step = self.current_step(&template, &request)?;
        let action =
            step.escalation.as_ref().map_or(EscalationAction::Notify, |policy| policy.action);

        match action {
            EscalationAction::Notify => {
                self.notify_step_approvers(
                    &request,
                    step,
                    NotificationKind::ApprovalTimeout,
                    "Approval overdue",
                    &format!(
                        "Document `{}` has exceeded the deadline for step `{}`",
                        request.document_id.0, step.name
                    ),
                );
                Ok(TimeoutOutcome::Notified)
            }
            EscalationAction::Reassign => {
                let target = step
                    .escalation
                    .as_ref()
                    .and_then(|policy| policy.escalate_to.clone())
                    .ok_or_else(|| {
                        EngineError::InvalidRequest(format!(
                            "step {} reassign escalation has no target",
                            step.order
                        ))
                    })?;
                let system_actor = self.options.system_actor.clone();
                self.escalate(
                    approval_id,
                    &system_actor,
                    &target,
                    Some("Automatic escalation due to timeout".to_string()),
                )
                .await?;
                Ok(TimeoutOutcome::Escalated)
            }
            EscalationAction::AutoApprove => {
                // A single synthetic approval satisfies the step even when
                // the quorum wants more; auto-approve does not try to fill
                // the full quorum.
                let system_actor = self.options.system_actor.clone();
                let outcome = self
                    .act(
                        approval_id,
                        &system_actor,
                        Decision::Approved,
                        Some("Auto-approved due to timeout".to_string()),
                        Vec::new(),
                    )
                    .await?;
                Ok(TimeoutOutcome::Acted(outcome))
            }
            EscalationAction::AutoReject => {
                let system_actor = self.options.system_actor.clone();
                let outcome = self
                    .act(
                        approval_id,
                        &system_actor,
                        Decision::Rejected,
                        Some("Auto-rejected due to timeout".to_string()),
                        Vec::new(),
                    )
                    .await?;
                Ok(TimeoutOutcome::Acted(outcome))
            }
        }
    }

    /// Deadline of the request's current step, if that step has a timeout.
    pub async fn current_deadline(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let template = self.template_for(request).await?;
        let step = self.current_step(&template, request)?;
        Ok(step.timeout_hours.map(|hours| request.step_started_at() + Duration::hours(hours)))
    }

    /// A user's approval queue: direct current-step membership or an
    /// effective delegation.
    pub async fn pending_queue(&self, user_id: &str) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.store.list_pending_for_approver(user_id).await?)
    }

    async fn load(&self, approval_id: &ApprovalId) -> Result<ApprovalRequest, EngineError> {
        self.store
            .approval(approval_id)
            .await?
            .ok_or_else(|| EngineError::not_found("approval request", approval_id.0.clone()))
    }

    async fn template_for(
        &self,
        request: &ApprovalRequest,
    ) -> Result<WorkflowTemplate, EngineError> {
        self.store
            .template(&request.workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow template", request.workflow_id.0.clone()))
    }

    fn current_step<'a>(
        &self,
        template: &'a WorkflowTemplate,
        request: &ApprovalRequest,
    ) -> Result<&'a Step, EngineError> {
        template.step(request.current_step_order).ok_or_else(|| {
            // A missing step for a live request is a data-integrity fault.
            tracing::error!(
                approval_id = %request.id.0,
                workflow_id = %request.workflow_id.0,
                step_order = request.current_step_order,
                "current step missing from template"
            );
            EngineError::InvalidRequest(format!(
                "workflow `{}` has no step {}",
                request.workflow_id.0, request.current_step_order
            ))
        })
    }

    /// The system pseudo-actor bypasses the approver-set check by this
    /// dedicated path; everyone else must be a listed approver or hold an
    /// effective delegation for the request.
    async fn authorize(
        &self,
        request: &ApprovalRequest,
        step: &Step,
        actor: &str,
    ) -> Result<(), EngineError> {
        if actor == self.options.system_actor {
            return Ok(());
        }
        if step.approver_ids.iter().any(|id| id == actor) {
            return Ok(());
        }

        let now = Utc::now();
        let delegations = self.store.delegations_for_approval(&request.id).await?;
        let delegated = delegations
            .iter()
            .any(|delegation| delegation.delegated_to == actor && delegation.is_effective(now));
        if delegated {
            return Ok(());
        }

        Err(EngineError::Forbidden(format!(
            "`{actor}` is not an approver or delegate for step {}",
            step.order
        )))
    }

    fn approval_count(&self, request: &ApprovalRequest, step_order: u32) -> usize {
        let approved = request
            .records_for_step(step_order)
            .filter(|record| record.decision == Decision::Approved);
        match self.options.quorum_counting {
            QuorumCounting::DistinctApprovers => approved
                .map(|record| record.approver_id.as_str())
                .collect::<HashSet<_>>()
                .len(),
            QuorumCounting::RawRecords => approved.count(),
        }
    }

    fn notify_step_approvers(
        &self,
        request: &ApprovalRequest,
        step: &Step,
        kind: NotificationKind,
        title: &str,
        message: &str,
    ) {
        for approver_id in &step.approver_ids {
            self.notifications.notify(
                Notification::new(approver_id, kind, title, message)
                    .with_context("approval_id", &request.id.0)
                    .with_context("document_id", &request.document_id.0)
                    .with_context("step_order", step.order.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{ActOutcome, ApprovalEngine, EngineOptions, QuorumCounting, TimeoutOutcome};
    use crate::audit::{AuditAction, InMemoryAuditSink};
    use crate::domain::approval::{ApprovalStatus, Decision};
    use crate::domain::document::Document;
    use crate::domain::workflow::{
        CompletionRule, EscalationAction, EscalationPolicy, Step, WorkflowId, WorkflowTemplate,
    };
    use crate::errors::EngineError;
    use crate::notify::{InMemoryNotificationSink, NotificationKind};
    use crate::store::{ApprovalStore, InMemoryStore, WorkflowStore};

    type TestEngine = ApprovalEngine<InMemoryStore, InMemoryNotificationSink, InMemoryAuditSink>;

    struct Harness {
        engine: TestEngine,
        store: Arc<InMemoryStore>,
        notifications: InMemoryNotificationSink,
        audit: InMemoryAuditSink,
    }

    fn harness() -> Harness {
        harness_with(EngineOptions::default())
    }

    fn harness_with(options: EngineOptions) -> Harness {
        let store = Arc::new(InMemoryStore::default());
        let notifications = InMemoryNotificationSink::default();
        let audit = InMemoryAuditSink::default();
        let engine =
            ApprovalEngine::new(store.clone(), notifications.clone(), audit.clone(), options);
        Harness { engine, store, notifications, audit }
    }

    fn step(order: u32, approvers: &[&str], completion: CompletionRule) -> Step {
        Step {
            order,
            name: format!("Step {order}"),
            approver_ids: approvers.iter().map(|id| id.to_string()).collect(),
            completion,
            timeout_hours: None,
            escalation: None,
            conditions: Vec::new(),
        }
    }

    fn template(id: &str, steps: Vec<Step>) -> WorkflowTemplate {
        WorkflowTemplate {
            id: WorkflowId(id.to_string()),
            owner_id: "u-owner".to_string(),
            name: id.to_string(),
            is_default: false,
            steps,
            trigger_conditions: Vec::new(),
            min_value: None,
            max_value: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn two_step_template() -> WorkflowTemplate {
        template(
            "wf-1",
            vec![
                step(1, &["A", "B"], CompletionRule::Quorum { required: 1 }),
                step(2, &["C"], CompletionRule::AllApprovers),
            ],
        )
    }

    fn document(id: &str) -> Document {
        Document::new(id, "u-owner", Decimal::new(2500, 0))
    }

    async fn submitted(harness: &Harness, template: &WorkflowTemplate, doc: &Document) -> String {
        harness.store.save_template(template.clone()).await.expect("save template");
        let request =
            harness.engine.submit(doc, template, "u-submitter", None).await.expect("submit");
        request.id.0
    }

    #[tokio::test]
    async fn submit_notifies_step_one_approvers_and_audits() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;

        let request = harness
            .store
            .approval(&crate::domain::approval::ApprovalId(approval_id))
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(request.current_step_order, 1);
        assert_eq!(request.status, ApprovalStatus::Pending);

        let sent = harness.notifications.sent();
        let recipients: Vec<&str> = sent.iter().map(|n| n.user_id.as_str()).collect();
        assert_eq!(recipients, vec!["A", "B"]);
        assert!(sent.iter().all(|n| n.kind == NotificationKind::ApprovalRequest));

        let entries = harness.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Submitted);
    }

    #[tokio::test]
    async fn duplicate_pending_submission_is_a_conflict() {
        let harness = harness();
        let template = two_step_template();
        let doc = document("doc-1");
        submitted(&harness, &template, &doc).await;

        let error = harness
            .engine
            .submit(&doc, &template, "u-submitter", None)
            .await
            .expect_err("duplicate pending must fail");
        assert!(matches!(error, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn resubmission_after_terminal_outcome_succeeds() {
        let harness = harness();
        let template = template("wf-1", vec![step(1, &["A"], CompletionRule::default())]);
        let doc = document("doc-1");
        let approval_id = submitted(&harness, &template, &doc).await;

        let id = crate::domain::approval::ApprovalId(approval_id);
        let outcome = harness
            .engine
            .act(&id, "A", Decision::Rejected, Some("too expensive".to_string()), Vec::new())
            .await
            .expect("reject");
        assert_eq!(outcome, ActOutcome::Rejected);

        harness.engine.submit(&doc, &template, "u-submitter", None).await.expect("resubmit");
    }

    #[tokio::test]
    async fn two_step_scenario_advances_then_rejects_terminally() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let outcome = harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("step 1 approval");
        assert_eq!(outcome, ActOutcome::AdvancedToStep { next_order: 2 });

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(request.current_step_order, 2);

        let outcome = harness
            .engine
            .act(&id, "C", Decision::Rejected, None, Vec::new())
            .await
            .expect("step 2 rejection");
        assert_eq!(outcome, ActOutcome::Rejected);

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Rejected);
        assert!(request.completed_at.is_some());
        // Prior approvals stay in the log even though the outcome is terminal.
        assert_eq!(request.records.len(), 2);
    }

    #[tokio::test]
    async fn quorum_needs_distinct_approvers_by_default() {
        let harness = harness();
        let template = template(
            "wf-1",
            vec![step(1, &["A", "B", "C"], CompletionRule::Quorum { required: 2 })],
        );
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let outcome = harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("first approval");
        assert_eq!(outcome, ActOutcome::PartialApproval { approvals: 1, required: 2 });

        // A duplicate approval from the same approver counts once.
        let outcome = harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("duplicate approval");
        assert_eq!(outcome, ActOutcome::PartialApproval { approvals: 1, required: 2 });

        let outcome = harness
            .engine
            .act(&id, "B", Decision::Approved, None, Vec::new())
            .await
            .expect("second distinct approval");
        assert_eq!(outcome, ActOutcome::Approved);
    }

    #[tokio::test]
    async fn raw_record_counting_lets_duplicates_fill_the_quorum() {
        let harness = harness_with(EngineOptions {
            quorum_counting: QuorumCounting::RawRecords,
            ..EngineOptions::default()
        });
        let template = template(
            "wf-1",
            vec![step(1, &["A", "B", "C"], CompletionRule::Quorum { required: 2 })],
        );
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("first approval");
        let outcome = harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("duplicate approval");
        assert_eq!(outcome, ActOutcome::Approved);
    }

    #[tokio::test]
    async fn unlisted_actor_is_forbidden() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let error = harness
            .engine
            .act(&id, "u-stranger", Decision::Approved, None, Vec::new())
            .await
            .expect_err("stranger cannot act");
        assert!(matches!(error, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn effective_delegation_authorizes_the_delegate() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        harness
            .engine
            .delegate(&id, "A", "u-deputy", Some("out of office".to_string()), Some(8))
            .await
            .expect("delegate");

        let outcome = harness
            .engine
            .act(&id, "u-deputy", Decision::Approved, None, Vec::new())
            .await
            .expect("delegate acts");
        assert_eq!(outcome, ActOutcome::AdvancedToStep { next_order: 2 });

        // The record names the acting delegate, not the delegator.
        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.records[0].approver_id, "u-deputy");
    }

    #[tokio::test]
    async fn expired_delegation_does_not_authorize() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        harness
            .engine
            .delegate(&id, "A", "u-deputy", None, Some(-1))
            .await
            .expect("create already-expired delegation");

        let error = harness
            .engine
            .act(&id, "u-deputy", Decision::Approved, None, Vec::new())
            .await
            .expect_err("expired delegation must not authorize");
        assert!(matches!(error, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn delegation_requires_current_step_membership() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        // C approves step 2, not step 1; delegation must be scoped to the
        // current step.
        let error = harness
            .engine
            .delegate(&id, "C", "u-deputy", None, None)
            .await
            .expect_err("future-step approver cannot delegate now");
        assert!(matches!(error, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn escalation_forces_the_request_out_of_pending() {
        let harness = harness();
        let template = two_step_template();
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        harness
            .engine
            .escalate(&id, "A", "u-vp", Some("needs senior eyes".to_string()))
            .await
            .expect("escalate");

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Escalated);

        let error = harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect_err("escalated request is not actionable");
        assert!(matches!(error, EngineError::Conflict(_)));

        assert_eq!(harness.store.escalations().await.len(), 1);
    }

    #[tokio::test]
    async fn timeout_notify_leaves_the_request_pending() {
        let harness = harness();
        let mut timed = step(1, &["A"], CompletionRule::default());
        timed.timeout_hours = Some(4);
        timed.escalation =
            Some(EscalationPolicy { action: EscalationAction::Notify, escalate_to: None });
        let template = template("wf-1", vec![timed]);
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let outcome = harness.engine.handle_timeout(&id).await.expect("timeout");
        assert_eq!(outcome, TimeoutOutcome::Notified);

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(harness
            .notifications
            .sent()
            .iter()
            .any(|n| n.kind == NotificationKind::ApprovalTimeout));
    }

    #[tokio::test]
    async fn timeout_reassign_escalates_as_the_system_actor() {
        let harness = harness();
        let mut timed = step(1, &["A"], CompletionRule::default());
        timed.timeout_hours = Some(4);
        timed.escalation = Some(EscalationPolicy {
            action: EscalationAction::Reassign,
            escalate_to: Some("u-vp".to_string()),
        });
        let template = template("wf-1", vec![timed]);
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let outcome = harness.engine.handle_timeout(&id).await.expect("timeout");
        assert_eq!(outcome, TimeoutOutcome::Escalated);

        let escalations = harness.store.escalations().await;
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].escalated_by, "system");
        assert_eq!(escalations[0].escalated_to, "u-vp");
        assert_eq!(
            escalations[0].reason.as_deref(),
            Some("Automatic escalation due to timeout")
        );
    }

    #[tokio::test]
    async fn auto_approve_satisfies_a_multi_approver_quorum_with_one_record() {
        let harness = harness();
        let mut timed = step(1, &["A", "B", "C"], CompletionRule::Quorum { required: 3 });
        timed.timeout_hours = Some(4);
        timed.escalation =
            Some(EscalationPolicy { action: EscalationAction::AutoApprove, escalate_to: None });
        let template = template("wf-1", vec![timed]);
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let outcome = harness.engine.handle_timeout(&id).await.expect("timeout");
        assert_eq!(outcome, TimeoutOutcome::Acted(ActOutcome::Approved));

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert_eq!(request.records.len(), 1);
        assert_eq!(request.records[0].approver_id, "system");
        assert_eq!(request.records[0].comment.as_deref(), Some("Auto-approved due to timeout"));
    }

    #[tokio::test]
    async fn auto_approve_advances_past_a_partially_approved_step() {
        let harness = harness();
        let mut timed = step(1, &["A", "B", "C"], CompletionRule::AllApprovers);
        timed.timeout_hours = Some(4);
        timed.escalation =
            Some(EscalationPolicy { action: EscalationAction::AutoApprove, escalate_to: None });
        let template =
            template("wf-1", vec![timed, step(2, &["D"], CompletionRule::default())]);
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("one of three approvals");

        let outcome = harness.engine.handle_timeout(&id).await.expect("timeout");
        assert_eq!(outcome, TimeoutOutcome::Acted(ActOutcome::AdvancedToStep { next_order: 2 }));

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(request.current_step_order, 2);
    }

    #[tokio::test]
    async fn auto_reject_terminates_the_request() {
        let harness = harness();
        let mut timed = step(1, &["A"], CompletionRule::default());
        timed.timeout_hours = Some(4);
        timed.escalation =
            Some(EscalationPolicy { action: EscalationAction::AutoReject, escalate_to: None });
        let template = template("wf-1", vec![timed]);
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        let outcome = harness.engine.handle_timeout(&id).await.expect("timeout");
        assert_eq!(outcome, TimeoutOutcome::Acted(ActOutcome::Rejected));

        let request = harness.store.approval(&id).await.expect("load").expect("exists");
        assert_eq!(request.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn partial_approval_is_audited() {
        let harness = harness();
        let template =
            template("wf-1", vec![step(1, &["A", "B"], CompletionRule::AllApprovers)]);
        let approval_id = submitted(&harness, &template, &document("doc-1")).await;
        let id = crate::domain::approval::ApprovalId(approval_id);

        harness
            .engine
            .act(&id, "A", Decision::Approved, None, Vec::new())
            .await
            .expect("first of two");

        let actions: Vec<AuditAction> =
            harness.audit.entries().iter().map(|entry| entry.action).collect();
        assert_eq!(actions, vec![AuditAction::Submitted, AuditAction::PartialApproval]);
    }

    #[tokio::test]
    async fn delete_template_is_refused_while_a_request_is_pending() {
        let harness = harness();
        let template = two_step_template();
        submitted(&harness, &template, &document("doc-1")).await;

        let error = harness
            .engine
            .delete_template(&template.id)
            .await
            .expect_err("pending request blocks deletion");
        assert!(matches!(error, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn save_template_rejects_invalid_definitions() {
        let harness = harness();
        let mut bad = two_step_template();
        bad.steps[1].order = 5;

        let error = harness.engine.save_template(bad).await.expect_err("gap in step orders");
        assert!(matches!(error, EngineError::InvalidRequest(_)));
    }
}
