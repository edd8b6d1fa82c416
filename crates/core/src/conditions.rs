use crate::domain::document::Document;
use crate::domain::workflow::{Condition, WorkflowTemplate};

/// Evaluate one condition against a document. Pure and total.
///
/// Numeric comparisons are inclusive on every boundary; that matches the
/// deployed behavior and callers depend on it. Conditions that reference a
/// document field the document does not carry evaluate `true`: matching
/// fails open so a partially-populated document is never silently excluded
/// from every workflow.
pub fn evaluate(condition: &Condition, document: &Document) -> bool {
    match condition {
        Condition::ValueAbove { value } => document.value >= *value,
        Condition::ValueBelow { value } => document.value <= *value,
        Condition::ValueBetween { min_value, max_value } => {
            document.value >= *min_value && document.value <= *max_value
        }
        Condition::ClientType { value } => document
            .client_type
            .as_deref()
            .map_or(true, |client_type| normalize_key(client_type) == normalize_key(value)),
        Condition::Category { value } => document
            .category
            .as_deref()
            .map_or(true, |category| normalize_key(category) == normalize_key(value)),
        Condition::DiscountAbove { value } => {
            document.discount_pct.map_or(true, |discount_pct| discount_pct >= *value)
        }
        Condition::CustomField { field, value } => {
            document.custom_fields.get(field).map_or(true, |actual| actual == value)
        }
    }
}

/// Whether a template's trigger conditions select this document.
///
/// A template with no triggers and no value bounds matches everything.
/// Otherwise the document value must sit within `[min_value, max_value]`
/// when either bound is set, and every trigger condition must hold.
pub fn matches_template(template: &WorkflowTemplate, document: &Document) -> bool {
    if template.trigger_conditions.is_empty()
        && template.min_value.is_none()
        && template.max_value.is_none()
    {
        return true;
    }

    if let Some(min_value) = template.min_value {
        if document.value < min_value {
            return false;
        }
    }
    if let Some(max_value) = template.max_value {
        if document.value > max_value {
            return false;
        }
    }

    template.trigger_conditions.iter().all(|condition| evaluate(condition, document))
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
