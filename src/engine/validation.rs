// Definition validation
// Rejects definitions that could never run before they are stored

use std::collections::HashSet;

use super::expression::ExpressionEvaluator;
use crate::models::{ActionParams, WorkflowDefinition};
use crate::{Result, WorkflowError};

/// Check a definition for configuration errors
///
/// Fails on the first problem found: missing names, triggers without an
/// operation, duplicate or empty action keys, params that do not parse for
/// their action type, invalid targets and expressions that do not compile.
pub fn validate_definition(definition: &WorkflowDefinition, evaluator: &ExpressionEvaluator) -> Result<()> {
    if definition.name.trim().is_empty() {
        return Err(WorkflowError::MissingRequiredField("name".to_string()));
    }
    if definition.schema_type.trim().is_empty() {
        return Err(WorkflowError::MissingRequiredField("schema_type".to_string()));
    }

    let document = &definition.document;
    for trigger in &document.triggers {
        if trigger.operation.trim().is_empty() {
            return Err(WorkflowError::MissingRequiredField("trigger operation".to_string()));
        }
        if let Some(expression) = &trigger.expression {
            evaluator.validate(expression)?;
        }
    }

    for condition in &document.conditions {
        evaluator.validate(&condition.expression)?;
    }

    let mut keys = HashSet::new();
    for action in &document.actions {
        let key = action.key.trim();
        if key.is_empty() {
            return Err(WorkflowError::MissingRequiredField("action key".to_string()));
        }
        if !keys.insert(key.to_string()) {
            return Err(WorkflowError::InvalidDefinition(format!("duplicate action key {}", key)));
        }
        if let Some(when) = &action.when {
            evaluator.validate(when)?;
        }

        match action.params()? {
            ActionParams::Approval(params) | ActionParams::Review(params) => {
                if params.targets.is_empty() {
                    return Err(WorkflowError::MissingRequiredField(format!("{} targets", action.key)));
                }
                for target in &params.targets {
                    target.validate()?;
                }
            }
            ActionParams::Notify(params) => {
                for target in &params.targets {
                    target.validate()?;
                }
            }
            ActionParams::Webhook(params) => {
                url::Url::parse(&params.url)
                    .map_err(|err| WorkflowError::InvalidDefinition(format!("{}: invalid url: {}", action.key, err)))?;
                if let Some(expression) = &params.payload_expr {
                    evaluator.validate(expression)?;
                }
            }
            ActionParams::FieldUpdate(_) | ActionParams::Integration(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, WorkflowAction, WorkflowTrigger};
    use serde_json::json;

    fn create_test_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("org-1", "Policy approval", "Policy")
            .with_trigger(WorkflowTrigger::new("UPDATE").with_fields(&["status"]))
            .with_condition("object.status != \"archived\"")
            .with_action(WorkflowAction::new(
                "approve",
                ActionType::RequestApproval,
                json!({ "targets": [{ "type": "GROUP", "id": "legal" }] }),
            ))
            .with_action(
                WorkflowAction::new("tell", ActionType::Notify, json!({ "targets": [{ "type": "USER", "id": "bob" }] }))
                    .with_when("assignments.approve.approved >= 1"),
            )
    }

    #[test]
    fn test_valid_definition() {
        let evaluator = ExpressionEvaluator::default();
        assert!(validate_definition(&create_test_definition(), &evaluator).is_ok());
    }

    #[test]
    fn test_duplicate_action_key() {
        let evaluator = ExpressionEvaluator::default();
        let definition = create_test_definition().with_action(WorkflowAction::new(
            "approve",
            ActionType::UpdateField,
            json!({ "updates": { "status": "done" } }),
        ));
        let err = validate_definition(&definition, &evaluator).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition(ref msg) if msg.contains("approve")));
    }

    #[test]
    fn test_bad_expression() {
        let evaluator = ExpressionEvaluator::default();
        let definition = create_test_definition().with_condition("object.status ==");
        assert!(matches!(
            validate_definition(&definition, &evaluator),
            Err(WorkflowError::ExpressionCompile(_))
        ));
    }

    #[test]
    fn test_bad_target_and_params() {
        let evaluator = ExpressionEvaluator::default();
        let definition = create_test_definition().with_action(WorkflowAction::new(
            "review",
            ActionType::RequestReview,
            json!({ "targets": [{ "type": "RESOLVER" }] }),
        ));
        assert!(matches!(
            validate_definition(&definition, &evaluator),
            Err(WorkflowError::MissingRequiredField(_))
        ));

        let definition = create_test_definition().with_action(WorkflowAction::new(
            "hook",
            ActionType::Webhook,
            json!({ "url": "not a url" }),
        ));
        assert!(matches!(
            validate_definition(&definition, &evaluator),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }
}
