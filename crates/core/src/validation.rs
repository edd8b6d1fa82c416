use crate::domain::workflow::{CompletionRule, EscalationAction, WorkflowTemplate};
use crate::errors::EngineError;

/// Validate a template at write time. Templates are validated once when an
/// author saves them, not on every read at approval time.
pub fn validate_template(template: &WorkflowTemplate) -> Result<(), EngineError> {
    if template.name.trim().is_empty() {
        return Err(invalid("template name must not be empty"));
    }

    if template.steps.is_empty() {
        return Err(invalid("template must define at least one step"));
    }

    let mut orders: Vec<u32> = template.steps.iter().map(|step| step.order).collect();
    orders.sort_unstable();
    for (index, order) in orders.iter().enumerate() {
        let expected = index as u32 + 1;
        if *order != expected {
            return Err(invalid(format!(
                "step orders must be contiguous starting at 1; expected {expected}, found {order}"
            )));
        }
    }

    for step in &template.steps {
        if step.approver_ids.is_empty() {
            return Err(invalid(format!("step {} has no approvers", step.order)));
        }

        if let CompletionRule::Quorum { required } = step.completion {
            if required == 0 || required as usize > step.approver_ids.len() {
                return Err(invalid(format!(
                    "step {} quorum {} is outside 1..={}",
                    step.order,
                    required,
                    step.approver_ids.len()
                )));
            }
        }

        match (&step.escalation, step.timeout_hours) {
            (Some(_), None) => {
                return Err(invalid(format!(
                    "step {} has an escalation policy but no timeout",
                    step.order
                )));
            }
            (Some(policy), Some(timeout_hours)) => {
                if timeout_hours <= 0 {
                    return Err(invalid(format!(
                        "step {} timeout must be positive, got {timeout_hours}",
                        step.order
                    )));
                }
                if policy.action == EscalationAction::Reassign && policy.escalate_to.is_none() {
                    return Err(invalid(format!(
                        "step {} reassign escalation needs a target user",
                        step.order
                    )));
                }
            }
            (None, Some(timeout_hours)) if timeout_hours <= 0 => {
                return Err(invalid(format!(
                    "step {} timeout must be positive, got {timeout_hours}",
                    step.order
                )));
            }
            _ => {}
        }
    }

    if let (Some(min_value), Some(max_value)) = (template.min_value, template.max_value) {
        if min_value > max_value {
            return Err(invalid("min_value must not exceed max_value"));
        }
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidRequest(message.into())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::validate_template;
    use crate::domain::workflow::{
        CompletionRule, EscalationAction, EscalationPolicy, Step, WorkflowId, WorkflowTemplate,
    };
    use crate::errors::EngineError;

    fn step(order: u32) -> Step {
        Step {
            order,
            name: format!("Step {order}"),
            approver_ids: vec!["u-a".to_string(), "u-b".to_string()],
            completion: CompletionRule::default(),
            timeout_hours: None,
            escalation: None,
            conditions: Vec::new(),
        }
    }

    fn template(steps: Vec<Step>) -> WorkflowTemplate {
        WorkflowTemplate {
            id: WorkflowId("wf-1".to_string()),
            owner_id: "u-owner".to_string(),
            name: "Standard".to_string(),
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

    fn assert_invalid(result: Result<(), EngineError>, fragment: &str) {
        match result {
            Err(EngineError::InvalidRequest(message)) => {
                assert!(message.contains(fragment), "message `{message}` lacks `{fragment}`");
            }
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn well_formed_template_passes() {
        assert!(validate_template(&template(vec![step(1), step(2)])).is_ok());
    }

    #[test]
    fn step_order_gap_is_rejected() {
        assert_invalid(validate_template(&template(vec![step(1), step(3)])), "contiguous");
    }

    #[test]
    fn duplicate_step_order_is_rejected() {
        assert_invalid(validate_template(&template(vec![step(1), step(1)])), "contiguous");
    }

    #[test]
    fn empty_approver_set_is_rejected() {
        let mut bad = step(1);
        bad.approver_ids.clear();
        assert_invalid(validate_template(&template(vec![bad])), "no approvers");
    }

    #[test]
    fn quorum_larger_than_approver_set_is_rejected() {
        let mut bad = step(1);
        bad.completion = CompletionRule::Quorum { required: 3 };
        assert_invalid(validate_template(&template(vec![bad])), "quorum");
    }

    #[test]
    fn reassign_without_target_is_rejected() {
        let mut bad = step(1);
        bad.timeout_hours = Some(24);
        bad.escalation =
            Some(EscalationPolicy { action: EscalationAction::Reassign, escalate_to: None });
        assert_invalid(validate_template(&template(vec![bad])), "target user");
    }

    #[test]
    fn escalation_without_timeout_is_rejected() {
        let mut bad = step(1);
        bad.escalation =
            Some(EscalationPolicy { action: EscalationAction::Notify, escalate_to: None });
        assert_invalid(validate_template(&template(vec![bad])), "no timeout");
    }

    #[test]
    fn inverted_value_bounds_are_rejected() {
        let mut bad = template(vec![step(1)]);
        bad.min_value = Some(Decimal::new(5000, 0));
        bad.max_value = Some(Decimal::new(1000, 0));
        assert_invalid(validate_template(&bad), "min_value");
    }
}
