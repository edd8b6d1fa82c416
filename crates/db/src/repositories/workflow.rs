use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use greenlight_core::domain::workflow::{Condition, Step, WorkflowId, WorkflowTemplate};
use greenlight_core::store::{StoreError, WorkflowStore};

use super::{backend, parse_timestamp, SqlStore};

const TEMPLATE_COLUMNS: &str = "id,
    owner_id,
    name,
    is_default,
    steps,
    trigger_conditions,
    min_value,
    max_value,
    is_active,
    created_at,
    updated_at";

impl SqlStore {
    /// Every stored template across all owners. Administrative inventory,
    /// not part of the engine-facing store surface.
    pub async fn all_templates(&self) -> Result<Vec<WorkflowTemplate>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS}
             FROM workflow_template
             ORDER BY owner_id ASC, name ASC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;

        rows.into_iter().map(template_from_row).collect()
    }
}

#[async_trait::async_trait]
impl WorkflowStore for SqlStore {
    async fn templates_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<WorkflowTemplate>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS}
             FROM workflow_template
             WHERE owner_id = ?
             ORDER BY name ASC"
        ))
        .bind(owner_id)
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;

        rows.into_iter().map(template_from_row).collect()
    }

    async fn template(&self, id: &WorkflowId) -> Result<Option<WorkflowTemplate>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS}
             FROM workflow_template
             WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(backend)?;

        row.map(template_from_row).transpose()
    }

    async fn save_template(&self, template: WorkflowTemplate) -> Result<(), StoreError> {
        let steps = serde_json::to_string(&template.steps)
            .map_err(|error| StoreError::Decode(format!("encode steps: {error}")))?;
        let trigger_conditions = serde_json::to_string(&template.trigger_conditions)
            .map_err(|error| StoreError::Decode(format!("encode trigger conditions: {error}")))?;

        let mut tx = self.pool().begin().await.map_err(backend)?;

        // At most one default per owner: promoting this template demotes the
        // previous default in the same transaction.
        if template.is_default {
            sqlx::query(
                "UPDATE workflow_template
                 SET is_default = 0
                 WHERE owner_id = ? AND id != ?",
            )
            .bind(&template.owner_id)
            .bind(&template.id.0)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        sqlx::query(
            "INSERT INTO workflow_template (
                id,
                owner_id,
                name,
                is_default,
                steps,
                trigger_conditions,
                min_value,
                max_value,
                is_active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                is_default = excluded.is_default,
                steps = excluded.steps,
                trigger_conditions = excluded.trigger_conditions,
                min_value = excluded.min_value,
                max_value = excluded.max_value,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&template.id.0)
        .bind(&template.owner_id)
        .bind(&template.name)
        .bind(template.is_default)
        .bind(&steps)
        .bind(&trigger_conditions)
        .bind(template.min_value.map(|value| value.to_string()))
        .bind(template.max_value.map(|value| value.to_string()))
        .bind(template.is_active)
        .bind(template.created_at.to_rfc3339())
        .bind(template.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)
    }

    async fn delete_template(&self, id: &WorkflowId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_template WHERE id = ?")
            .bind(&id.0)
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }
}

fn template_from_row(row: SqliteRow) -> Result<WorkflowTemplate, StoreError> {
    let steps_raw = row.try_get::<String, _>("steps").map_err(backend)?;
    let steps: Vec<Step> = serde_json::from_str(&steps_raw)
        .map_err(|error| StoreError::Decode(format!("decode steps: {error}")))?;

    let conditions_raw = row.try_get::<String, _>("trigger_conditions").map_err(backend)?;
    let trigger_conditions: Vec<Condition> = serde_json::from_str(&conditions_raw)
        .map_err(|error| StoreError::Decode(format!("decode trigger conditions: {error}")))?;

    Ok(WorkflowTemplate {
        id: WorkflowId(row.try_get("id").map_err(backend)?),
        owner_id: row.try_get("owner_id").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        is_default: row.try_get("is_default").map_err(backend)?,
        steps,
        trigger_conditions,
        min_value: parse_optional_decimal("min_value", row.try_get("min_value").map_err(backend)?)?,
        max_value: parse_optional_decimal("max_value", row.try_get("max_value").map_err(backend)?)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(backend)?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at").map_err(backend)?)?,
    })
}

fn parse_optional_decimal(column: &str, value: Option<String>) -> Result<Option<Decimal>, StoreError> {
    value
        .map(|raw| {
            raw.parse::<Decimal>().map_err(|error| {
                StoreError::Decode(format!("invalid decimal in `{column}`: `{raw}` ({error})"))
            })
        })
        .transpose()
}
