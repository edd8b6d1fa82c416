use std::collections::HashMap;

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use greenlight_core::domain::approval::{
    ApprovalId, ApprovalRecord, ApprovalRequest, ApprovalStatus, Decision, Delegation, Escalation,
};
use greenlight_core::domain::document::DocumentId;
use greenlight_core::domain::workflow::{WorkflowId, WorkflowTemplate};
use greenlight_core::store::{ApprovalStore, StoreError, WorkflowStore};

use super::{backend, parse_optional_timestamp, parse_timestamp, parse_u32, SqlStore};

const REQUEST_COLUMNS: &str = "id,
    document_id,
    workflow_id,
    current_step_order,
    status,
    submitted_by,
    submitted_at,
    notes,
    completed_at";

const RECORD_COLUMNS: &str = "id,
    approval_id,
    step_order,
    approver_id,
    decision,
    comment,
    condition_tags,
    recorded_at";

const DELEGATION_COLUMNS: &str = "id,
    approval_id,
    delegated_by,
    delegated_to,
    reason,
    expires_at,
    is_active,
    created_at";

impl SqlStore {
    async fn records_for(&self, approval_id: &ApprovalId) -> Result<Vec<ApprovalRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM approval_record
             WHERE approval_id = ?
             ORDER BY recorded_at ASC, id ASC"
        ))
        .bind(&approval_id.0)
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn assemble(&self, row: SqliteRow) -> Result<ApprovalRequest, StoreError> {
        let mut request = request_from_row(row)?;
        request.records = self.records_for(&request.id).await?;
        Ok(request)
    }
}

#[async_trait::async_trait]
impl ApprovalStore for SqlStore {
    async fn approval(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM approval_request
             WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_pending_for_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM approval_request
             WHERE document_id = ? AND status = 'pending'
             ORDER BY submitted_at DESC
             LIMIT 1"
        ))
        .bind(&document_id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn save(&self, request: ApprovalRequest) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await.map_err(backend)?;

        sqlx::query(
            "INSERT INTO approval_request (
                id,
                document_id,
                workflow_id,
                current_step_order,
                status,
                submitted_by,
                submitted_at,
                notes,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                document_id = excluded.document_id,
                workflow_id = excluded.workflow_id,
                current_step_order = excluded.current_step_order,
                status = excluded.status,
                submitted_by = excluded.submitted_by,
                submitted_at = excluded.submitted_at,
                notes = excluded.notes,
                completed_at = excluded.completed_at",
        )
        .bind(&request.id.0)
        .bind(&request.document_id.0)
        .bind(&request.workflow_id.0)
        .bind(i64::from(request.current_step_order))
        .bind(request.status.as_str())
        .bind(&request.submitted_by)
        .bind(request.submitted_at.to_rfc3339())
        .bind(request.notes.as_deref())
        .bind(request.completed_at.map(|value| value.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        // Records are append-only and keyed by id, so a retried save of the
        // same aggregate never double-applies a decision.
        for record in &request.records {
            let condition_tags = serde_json::to_string(&record.condition_tags)
                .map_err(|error| StoreError::Decode(format!("encode condition tags: {error}")))?;

            sqlx::query(
                "INSERT OR IGNORE INTO approval_record (
                    id,
                    approval_id,
                    step_order,
                    approver_id,
                    decision,
                    comment,
                    condition_tags,
                    recorded_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&request.id.0)
            .bind(i64::from(record.step_order))
            .bind(&record.approver_id)
            .bind(record.decision.as_str())
            .bind(record.comment.as_deref())
            .bind(&condition_tags)
            .bind(record.recorded_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM approval_request
             WHERE status = 'pending'
             ORDER BY submitted_at ASC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            pending.push(self.assemble(row).await?);
        }
        Ok(pending)
    }

    async fn list_pending_for_approver(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let now = Utc::now();
        let pending = self.list_pending().await?;

        let delegation_rows = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS}
             FROM delegation
             WHERE delegated_to = ?"
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;
        let delegations = delegation_rows
            .into_iter()
            .map(delegation_from_row)
            .collect::<Result<Vec<Delegation>, StoreError>>()?;

        let mut templates: HashMap<WorkflowId, Option<WorkflowTemplate>> = HashMap::new();
        let mut queue = Vec::new();
        for request in pending {
            let template = match templates.get(&request.workflow_id) {
                Some(template) => template.clone(),
                None => {
                    let loaded = WorkflowStore::template(self, &request.workflow_id).await?;
                    templates.insert(request.workflow_id.clone(), loaded.clone());
                    loaded
                }
            };

            let direct = template
                .as_ref()
                .and_then(|template| template.step(request.current_step_order))
                .is_some_and(|step| step.approver_ids.iter().any(|id| id == user_id));
            let delegated = delegations.iter().any(|delegation| {
                delegation.approval_id == request.id && delegation.is_effective(now)
            });

            if direct || delegated {
                queue.push(request);
            }
        }
        Ok(queue)
    }

    async fn create_delegation(&self, delegation: Delegation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO delegation (
                id,
                approval_id,
                delegated_by,
                delegated_to,
                reason,
                expires_at,
                is_active,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&delegation.id)
        .bind(&delegation.approval_id.0)
        .bind(&delegation.delegated_by)
        .bind(&delegation.delegated_to)
        .bind(delegation.reason.as_deref())
        .bind(delegation.expires_at.map(|value| value.to_rfc3339()))
        .bind(delegation.is_active)
        .bind(delegation.created_at.to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delegations_for_approval(
        &self,
        id: &ApprovalId,
    ) -> Result<Vec<Delegation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS}
             FROM delegation
             WHERE approval_id = ?
             ORDER BY created_at ASC"
        ))
        .bind(&id.0)
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;

        rows.into_iter().map(delegation_from_row).collect()
    }

    async fn create_escalation(&self, escalation: Escalation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO escalation (
                id,
                approval_id,
                escalated_by,
                escalated_to,
                reason,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&escalation.id)
        .bind(&escalation.approval_id.0)
        .bind(&escalation.escalated_by)
        .bind(&escalation.escalated_to)
        .bind(escalation.reason.as_deref())
        .bind(escalation.created_at.to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }
}

fn request_from_row(row: SqliteRow) -> Result<ApprovalRequest, StoreError> {
    let status_raw = row.try_get::<String, _>("status").map_err(backend)?;
    let status = ApprovalStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown approval status `{status_raw}`")))?;

    Ok(ApprovalRequest {
        id: ApprovalId(row.try_get("id").map_err(backend)?),
        document_id: DocumentId(row.try_get("document_id").map_err(backend)?),
        workflow_id: WorkflowId(row.try_get("workflow_id").map_err(backend)?),
        current_step_order: parse_u32(
            "current_step_order",
            row.try_get("current_step_order").map_err(backend)?,
        )?,
        status,
        submitted_by: row.try_get("submitted_by").map_err(backend)?,
        submitted_at: parse_timestamp(
            "submitted_at",
            row.try_get("submitted_at").map_err(backend)?,
        )?,
        notes: row.try_get("notes").map_err(backend)?,
        records: Vec::new(),
        completed_at: parse_optional_timestamp(
            "completed_at",
            row.try_get("completed_at").map_err(backend)?,
        )?,
    })
}

fn record_from_row(row: SqliteRow) -> Result<ApprovalRecord, StoreError> {
    let decision_raw = row.try_get::<String, _>("decision").map_err(backend)?;
    let decision = Decision::parse(&decision_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown decision `{decision_raw}`")))?;

    let tags_raw = row.try_get::<String, _>("condition_tags").map_err(backend)?;
    let condition_tags: Vec<String> = serde_json::from_str(&tags_raw)
        .map_err(|error| StoreError::Decode(format!("decode condition tags: {error}")))?;

    Ok(ApprovalRecord {
        id: row.try_get("id").map_err(backend)?,
        step_order: parse_u32("step_order", row.try_get("step_order").map_err(backend)?)?,
        approver_id: row.try_get("approver_id").map_err(backend)?,
        decision,
        comment: row.try_get("comment").map_err(backend)?,
        condition_tags,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at").map_err(backend)?)?,
    })
}

fn delegation_from_row(row: SqliteRow) -> Result<Delegation, StoreError> {
    Ok(Delegation {
        id: row.try_get("id").map_err(backend)?,
        approval_id: ApprovalId(row.try_get("approval_id").map_err(backend)?),
        delegated_by: row.try_get("delegated_by").map_err(backend)?,
        delegated_to: row.try_get("delegated_to").map_err(backend)?,
        reason: row.try_get("reason").map_err(backend)?,
        expires_at: parse_optional_timestamp(
            "expires_at",
            row.try_get("expires_at").map_err(backend)?,
        )?,
        is_active: row.try_get("is_active").map_err(backend)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(backend)?)?,
    })
}
