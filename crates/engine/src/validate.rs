//! Definition validation, run before a definition is persisted.
//!
//! Rules enforced:
//! 1. The document names its schema type and has at least one trigger.
//! 2. Trigger operations are `CREATE`, `UPDATE` or `DELETE`; field and edge
//!    names are non-blank; expressions compile in the base scope.
//! 3. Conditions compile in the base scope.
//! 4. Action keys are present and unique, types are known and `when` guards
//!    compile in the action scope.
//! 5. Approval and review params parse and name at least one target;
//!    approvals only gate eligible fields, and no two approvals gate the
//!    same field set.
//!
//! Every problem is reported, not just the first.

use std::collections::HashSet;

use serde_json::Value;

use crate::cel::{CelEvaluator, ExpressionScope};
use crate::changeset::normalize_strings;
use crate::domain::derive_domain_key;
use crate::models::{ActionType, ApprovalActionParams, WorkflowDefinitionDocument};
use crate::object::WorkflowRegistry;
use crate::EngineError;

const OPERATIONS: [&str; 3] = ["CREATE", "UPDATE", "DELETE"];

/// Validate a raw definition document.
pub fn validate_definition_value(
    value: &Value,
    cel: &CelEvaluator,
    registry: Option<&WorkflowRegistry>,
) -> Result<WorkflowDefinitionDocument, EngineError> {
    let doc = WorkflowDefinitionDocument::from_value(value)
        .map_err(|e| EngineError::DefinitionInvalid(vec![e.to_string()]))?;
    validate_definition(&doc, cel, registry)?;
    Ok(doc)
}

/// Validate a parsed definition.
///
/// # Errors
/// [`EngineError::DefinitionInvalid`] listing every problem found.
pub fn validate_definition(
    doc: &WorkflowDefinitionDocument,
    cel: &CelEvaluator,
    registry: Option<&WorkflowRegistry>,
) -> Result<(), EngineError> {
    let mut problems = Vec::new();

    // -----------------------------------------------------------------------
    // 1. Shape
    // -----------------------------------------------------------------------
    let schema_type = doc.schema_type.trim();
    if schema_type.is_empty() {
        problems.push("schemaType is required".to_string());
    }
    if doc.triggers.is_empty() {
        problems.push("at least one trigger is required".to_string());
    }

    // -----------------------------------------------------------------------
    // 2. Triggers
    // -----------------------------------------------------------------------
    for (i, trigger) in doc.triggers.iter().enumerate() {
        let operation = trigger.operation.trim().to_ascii_uppercase();
        if !OPERATIONS.contains(&operation.as_str()) {
            problems.push(format!("trigger {i}: operation '{}' must be one of {}", trigger.operation, OPERATIONS.join(", ")));
        }
        let object_type = trigger.object_type.trim();
        if !object_type.is_empty() && !schema_type.is_empty() && object_type != schema_type {
            problems.push(format!("trigger {i}: objectType '{object_type}' does not match schemaType '{schema_type}'"));
        }
        if trigger.fields.iter().any(|f| f.trim().is_empty()) {
            problems.push(format!("trigger {i}: field names must not be blank"));
        }
        if trigger.edges.iter().any(|e| e.trim().is_empty()) {
            problems.push(format!("trigger {i}: edge names must not be blank"));
        }
        if !trigger.expression.trim().is_empty() {
            if let Err(e) = cel.compile(&trigger.expression, ExpressionScope::Base) {
                problems.push(format!("trigger {i}: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Conditions
    // -----------------------------------------------------------------------
    for (i, condition) in doc.conditions.iter().enumerate() {
        if condition.expression.trim().is_empty() {
            problems.push(format!("condition {i}: expression is required"));
        } else if let Err(e) = cel.compile(&condition.expression, ExpressionScope::Base) {
            problems.push(format!("condition {i}: {e}"));
        }
    }

    // -----------------------------------------------------------------------
    // 4. Actions
    // -----------------------------------------------------------------------
    let mut keys: HashSet<&str> = HashSet::new();
    let mut domains: HashSet<String> = HashSet::new();
    for (i, action) in doc.actions.iter().enumerate() {
        let key = action.key.trim();
        if key.is_empty() {
            problems.push(format!("action {i}: key is required"));
        } else if !keys.insert(key) {
            problems.push(format!("action {i}: duplicate key '{key}'"));
        }
        if !action.when.trim().is_empty() {
            if let Err(e) = cel.compile(&action.when, ExpressionScope::Action) {
                problems.push(format!("action '{key}': {e}"));
            }
        }

        let action_type = match action.action_type() {
            Some(t) => t,
            None => {
                problems.push(format!("action '{key}': unknown type '{}'", action.kind));
                continue;
            }
        };
        if !matches!(action_type, ActionType::RequestApproval | ActionType::RequestReview) {
            continue;
        }

        // -------------------------------------------------------------------
        // 5. Approvals and reviews
        // -------------------------------------------------------------------
        let params: ApprovalActionParams = match action.parse_params() {
            Ok(p) => p,
            Err(e) => {
                problems.push(format!("action '{key}': {e}"));
                continue;
            }
        };
        if params.targets.is_empty() {
            problems.push(format!("action '{key}': at least one target is required"));
        }
        if action_type != ActionType::RequestApproval {
            continue;
        }

        let mut fields = normalize_strings(&params.fields);
        if fields.is_empty() {
            continue;
        }
        if let Some(eligible) = registry.and_then(|r| r.eligible_fields(schema_type)) {
            for field in fields.iter().filter(|f| !eligible.contains(*f)) {
                problems.push(format!("action '{key}': field '{field}' is not eligible for approval on {schema_type}"));
            }
        }
        fields.sort();
        if !domains.insert(derive_domain_key(schema_type, &fields)) {
            problems.push(format!("action '{key}': another approval already gates fields [{}]", fields.join(", ")));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::DefinitionInvalid(problems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CelConfig;
    use serde_json::json;

    fn cel() -> CelEvaluator {
        CelEvaluator::new(CelConfig::default())
    }

    fn problems(value: Value, registry: Option<&WorkflowRegistry>) -> Vec<String> {
        match validate_definition_value(&value, &cel(), registry) {
            Ok(_) => Vec::new(),
            Err(EngineError::DefinitionInvalid(p)) => p,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    fn approval(key: &str, fields: &[&str]) -> Value {
        json!({
            "key": key,
            "type": "REQUEST_APPROVAL",
            "params": {"targets": [{"type": "USER", "id": "u1"}], "fields": fields}
        })
    }

    #[test]
    fn valid_definition_passes() {
        let doc = json!({
            "schemaType": "Control",
            "triggers": [{"operation": "UPDATE", "fields": ["status"], "expression": "'status' in changed_fields"}],
            "conditions": [{"expression": "object.status != 'ARCHIVED'"}],
            "actions": [
                approval("approve", &["status"]),
                {"key": "tell", "type": "NOTIFY", "when": "size(assignments) > 0", "params": {"targets": [{"type": "USER", "id": "u1"}]}}
            ]
        });
        assert!(problems(doc, None).is_empty());
    }

    #[test]
    fn reports_every_problem() {
        let doc = json!({
            "schemaType": "Control",
            "triggers": [{"operation": "UPSERT", "fields": [" "]}],
            "actions": [
                {"key": "a", "type": "NOTIFY"},
                {"key": "a", "type": "EXPLODE"},
                {"key": "", "type": "REQUEST_REVIEW", "params": {"targets": []}}
            ]
        });
        let found = problems(doc, None);
        assert_eq!(found.len(), 6, "{found:#?}");
        assert!(found.iter().any(|p| p.contains("operation 'UPSERT'")));
        assert!(found.iter().any(|p| p.contains("duplicate key 'a'")));
        assert!(found.iter().any(|p| p.contains("unknown type 'EXPLODE'")));
        assert!(found.iter().any(|p| p.contains("key is required")));
        assert!(found.iter().any(|p| p.contains("at least one target")));
    }

    #[test]
    fn missing_triggers_and_schema_type() {
        let found = problems(json!({"actions": []}), None);
        assert!(found.contains(&"schemaType is required".to_string()));
        assert!(found.contains(&"at least one trigger is required".to_string()));
    }

    #[test]
    fn approval_fields_must_be_eligible_and_distinct() {
        let registry = WorkflowRegistry::new().with_eligible_fields("Control", ["status", "owner"]);
        let doc = json!({
            "schemaType": "Control",
            "triggers": [{"operation": "UPDATE"}],
            "actions": [
                approval("first", &["status", "owner"]),
                approval("second", &["owner", "status"]),
                approval("third", &["secret"])
            ]
        });
        let found = problems(doc, Some(&registry));
        assert_eq!(found.len(), 2, "{found:#?}");
        assert!(found[0].contains("another approval already gates fields [owner, status]"));
        assert!(found[1].contains("field 'secret' is not eligible"));
    }

    #[test]
    fn bad_expressions_are_reported_per_location() {
        let doc = json!({
            "schemaType": "Control",
            "triggers": [{"operation": "CREATE", "expression": "object.("}],
            "actions": [{"key": "n", "type": "NOTIFY", "when": "assignments.(("}]
        });
        let found = problems(doc, None);
        assert_eq!(found.len(), 2, "{found:#?}");
        assert!(found[0].starts_with("trigger 0:"));
        assert!(found[1].starts_with("action 'n':"));
    }

    #[test]
    fn unparseable_documents_are_invalid() {
        let found = problems(json!({"triggers": "nope"}), None);
        assert_eq!(found.len(), 1);
    }
}
