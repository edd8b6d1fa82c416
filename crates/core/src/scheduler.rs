use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::audit::AuditSink;
use crate::engine::ApprovalEngine;
use crate::errors::EngineError;
use crate::notify::NotificationSink;
use crate::store::{ApprovalStore, WorkflowStore};

/// Outcome of a single sweep over the pending set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Pending requests examined.
    pub scanned: usize,
    /// Requests whose deadline had passed and whose escalation policy was
    /// applied.
    pub dispatched: usize,
    /// Requests that failed to dispatch. Failures are isolated per request
    /// so one bad row never stalls the rest of the sweep.
    pub failures: usize,
}

/// Periodically sweeps pending approvals and fires the engine's timeout
/// handling for any whose current-step deadline has passed. Timeouts are
/// detected only by this polling sweep, so timeout precision is bounded by
/// the scan interval.
pub struct TimeoutScheduler<S, N, A> {
    engine: Arc<ApprovalEngine<S, N, A>>,
}

impl<S, N, A> TimeoutScheduler<S, N, A>
where
    S: WorkflowStore + ApprovalStore,
    N: NotificationSink,
    A: AuditSink,
{
    pub fn new(engine: Arc<ApprovalEngine<S, N, A>>) -> Self {
        Self { engine }
    }

    /// One sweep: find overdue pending requests and dispatch each.
    pub async fn scan_and_dispatch(&self) -> Result<ScanReport, EngineError> {
        let now = Utc::now();
        let pending = self.engine.store().list_pending().await?;

        let mut report = ScanReport { scanned: pending.len(), ..ScanReport::default() };
        for request in pending {
            let deadline = match self.engine.current_deadline(&request).await {
                Ok(deadline) => deadline,
                Err(error) => {
                    tracing::warn!(
                        approval_id = %request.id.0,
                        %error,
                        "skipping request with unresolvable deadline"
                    );
                    report.failures += 1;
                    continue;
                }
            };
            let Some(deadline) = deadline else { continue };
            if deadline > now {
                continue;
            }

            match self.engine.handle_timeout(&request.id).await {
                Ok(outcome) => {
                    tracing::info!(
                        approval_id = %request.id.0,
                        ?outcome,
                        "timeout dispatched"
                    );
                    report.dispatched += 1;
                }
                // Conflict means a human action landed between the listing
                // and the dispatch; the next sweep sees the settled state.
                Err(EngineError::Conflict(reason)) => {
                    tracing::debug!(approval_id = %request.id.0, reason, "timeout raced an action");
                }
                Err(error) => {
                    tracing::warn!(approval_id = %request.id.0, %error, "timeout dispatch failed");
                    report.failures += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run sweeps forever at a fixed period. Errors listing the pending set
    /// are logged and retried on the next tick.
    pub async fn run(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.scan_and_dispatch().await {
                Ok(report) => {
                    if report.dispatched > 0 || report.failures > 0 {
                        tracing::info!(
                            scanned = report.scanned,
                            dispatched = report.dispatched,
                            failures = report.failures,
                            "timeout sweep finished"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "timeout sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::TimeoutScheduler;
    use crate::audit::InMemoryAuditSink;
    use crate::domain::approval::ApprovalStatus;
    use crate::domain::document::Document;
    use crate::domain::workflow::{
        CompletionRule, EscalationAction, EscalationPolicy, Step, WorkflowId, WorkflowTemplate,
    };
    use crate::engine::{ApprovalEngine, EngineOptions};
    use crate::notify::InMemoryNotificationSink;
    use crate::store::{ApprovalStore, InMemoryStore, WorkflowStore};

    fn timed_template(timeout_hours: Option<i64>, action: EscalationAction) -> WorkflowTemplate {
        WorkflowTemplate {
            id: WorkflowId("wf-timed".to_string()),
            owner_id: "u-owner".to_string(),
            name: "Timed".to_string(),
            is_default: false,
            steps: vec![Step {
                order: 1,
                name: "Review".to_string(),
                approver_ids: vec!["u-mgr".to_string()],
                completion: CompletionRule::default(),
                timeout_hours,
                escalation: timeout_hours.map(|_| EscalationPolicy {
                    action,
                    escalate_to: Some("u-vp".to_string()),
                }),
                conditions: Vec::new(),
            }],
            trigger_conditions: Vec::new(),
            min_value: None,
            max_value: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn engine_with(
        template: &WorkflowTemplate,
    ) -> Arc<ApprovalEngine<InMemoryStore, InMemoryNotificationSink, InMemoryAuditSink>> {
        let store = Arc::new(InMemoryStore::default());
        store.save_template(template.clone()).await.expect("save template");
        Arc::new(ApprovalEngine::new(
            store,
            InMemoryNotificationSink::default(),
            InMemoryAuditSink::default(),
            EngineOptions::default(),
        ))
    }

    #[tokio::test]
    async fn overdue_request_is_dispatched() {
        let template = timed_template(Some(4), EscalationAction::Reassign);
        let engine = engine_with(&template).await;
        let document = Document::new("doc-1", "u-owner", Decimal::new(500, 0));
        let request =
            engine.submit(&document, &template, "u-submitter", None).await.expect("submit");

        // Backdate the submission past the 4 hour deadline.
        let mut overdue = engine.store().approval(&request.id).await.expect("load").expect("row");
        overdue.submitted_at = Utc::now() - Duration::hours(6);
        engine.store().save(overdue).await.expect("backdate");

        let scheduler = TimeoutScheduler::new(engine.clone());
        let report = scheduler.scan_and_dispatch().await.expect("sweep");
        assert_eq!(report.scanned, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failures, 0);

        let settled = engine.store().approval(&request.id).await.expect("load").expect("row");
        assert_eq!(settled.status, ApprovalStatus::Escalated);
    }

    #[tokio::test]
    async fn requests_within_their_deadline_are_left_alone() {
        let template = timed_template(Some(4), EscalationAction::Reassign);
        let engine = engine_with(&template).await;
        let document = Document::new("doc-1", "u-owner", Decimal::new(500, 0));
        let request =
            engine.submit(&document, &template, "u-submitter", None).await.expect("submit");

        let scheduler = TimeoutScheduler::new(engine.clone());
        let report = scheduler.scan_and_dispatch().await.expect("sweep");
        assert_eq!(report.scanned, 1);
        assert_eq!(report.dispatched, 0);

        let settled = engine.store().approval(&request.id).await.expect("load").expect("row");
        assert_eq!(settled.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn steps_without_timeouts_never_dispatch() {
        let template = timed_template(None, EscalationAction::Notify);
        let engine = engine_with(&template).await;
        let document = Document::new("doc-1", "u-owner", Decimal::new(500, 0));
        let request =
            engine.submit(&document, &template, "u-submitter", None).await.expect("submit");

        let mut old = engine.store().approval(&request.id).await.expect("load").expect("row");
        old.submitted_at = Utc::now() - Duration::days(30);
        engine.store().save(old).await.expect("backdate");

        let scheduler = TimeoutScheduler::new(engine.clone());
        let report = scheduler.scan_and_dispatch().await.expect("sweep");
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn a_request_with_missing_workflow_data_does_not_stall_the_sweep() {
        let healthy = timed_template(Some(4), EscalationAction::Reassign);
        let mut orphaned = timed_template(Some(4), EscalationAction::Reassign);
        orphaned.id = WorkflowId("wf-orphan".to_string());
        orphaned.name = "Orphaned".to_string();

        let store = Arc::new(InMemoryStore::default());
        store.save_template(healthy.clone()).await.expect("save healthy");
        store.save_template(orphaned.clone()).await.expect("save orphaned");
        let engine = Arc::new(ApprovalEngine::new(
            store.clone(),
            InMemoryNotificationSink::default(),
            InMemoryAuditSink::default(),
            EngineOptions::default(),
        ));

        let doc_a = Document::new("doc-a", "u-owner", Decimal::new(500, 0));
        let doc_b = Document::new("doc-b", "u-owner", Decimal::new(500, 0));
        let healthy_request =
            engine.submit(&doc_a, &healthy, "u-submitter", None).await.expect("submit healthy");
        let orphaned_request =
            engine.submit(&doc_b, &orphaned, "u-submitter", None).await.expect("submit orphaned");

        for id in [&healthy_request.id, &orphaned_request.id] {
            let mut row = store.approval(id).await.expect("load").expect("row");
            row.submitted_at = Utc::now() - Duration::hours(6);
            store.save(row).await.expect("backdate");
        }
        // The template vanishes out from under its pending request.
        store.delete_template(&orphaned.id).await.expect("drop template");

        let scheduler = TimeoutScheduler::new(engine.clone());
        let report = scheduler.scan_and_dispatch().await.expect("sweep");
        assert_eq!(report.scanned, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failures, 1);

        let settled = store.approval(&healthy_request.id).await.expect("load").expect("row");
        assert_eq!(settled.status, ApprovalStatus::Escalated);
        let stuck = store.approval(&orphaned_request.id).await.expect("load").expect("row");
        assert_eq!(stuck.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn a_fresh_record_resets_the_step_clock() {
        let template = timed_template(Some(4), EscalationAction::Reassign);
        let engine = engine_with(&template).await;
        let document = Document::new("doc-1", "u-owner", Decimal::new(500, 0));
        let request =
            engine.submit(&document, &template, "u-submitter", None).await.expect("submit");

        // Old submission, but a record landed just now: the step clock runs
        // from the record, so the deadline has not passed.
        let mut row = engine.store().approval(&request.id).await.expect("load").expect("row");
        row.submitted_at = Utc::now() - Duration::days(3);
        row.records.push(crate::domain::approval::ApprovalRecord {
            id: "rec-1".to_string(),
            step_order: 1,
            approver_id: "u-mgr".to_string(),
            decision: crate::domain::approval::Decision::Approved,
            comment: None,
            condition_tags: Vec::new(),
            recorded_at: Utc::now() - Duration::minutes(5),
        });
        engine.store().save(row).await.expect("rewrite");

        let scheduler = TimeoutScheduler::new(engine.clone());
        let report = scheduler.scan_and_dispatch().await.expect("sweep");
        assert_eq!(report.dispatched, 0);
    }
}
