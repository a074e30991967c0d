//! Trigger matching and definition pre-filtering.

use std::collections::HashSet;

use crate::changeset::normalize_strings;
use crate::models::{WorkflowDefinitionDocument, WorkflowTrigger};

/// Cheap filter a host query layer can apply before full evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerPrefilter {
    /// Distinct upper-cased operations.
    pub operations: Vec<String>,
    /// Union of trigger fields and edges; `None` disables field filtering.
    pub fields: Option<Vec<String>>,
}

pub fn derive_trigger_prefilter(definition: &WorkflowDefinitionDocument) -> TriggerPrefilter {
    let operations = normalize_strings(
        definition
            .triggers
            .iter()
            .map(|t| t.operation.trim().to_ascii_uppercase()),
    );

    // One unfiltered trigger means any field may match.
    let fields = if definition.triggers.iter().any(|t| !t.has_field_filter()) {
        None
    } else {
        Some(normalize_strings(definition.triggers.iter().flat_map(|t| t.field_filter())))
    };

    TriggerPrefilter { operations, fields }
}

/// Triggers of `definition` that match `event_type` with the given changes.
pub fn matching_triggers<'a>(
    definition: &'a WorkflowDefinitionDocument,
    event_type: &'a str,
    changed_fields: &'a [String],
) -> impl Iterator<Item = &'a WorkflowTrigger> + 'a {
    let changed: HashSet<&str> = changed_fields.iter().map(String::as_str).collect();

    definition.triggers.iter().filter(move |trigger| {
        let op = trigger.operation.trim();
        if !op.is_empty() && !op.eq_ignore_ascii_case(event_type.trim()) {
            return false;
        }
        if !trigger.has_field_filter() {
            return true;
        }
        trigger.field_filter().any(|f| changed.contains(f.trim()))
    })
}

/// Whether any trigger matches `event_type` with the given changes.
pub fn definition_matches_trigger(
    definition: &WorkflowDefinitionDocument,
    event_type: &str,
    changed_fields: &[String],
) -> bool {
    matching_triggers(definition, event_type, changed_fields).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(triggers: serde_json::Value) -> WorkflowDefinitionDocument {
        WorkflowDefinitionDocument::from_value(&json!({"schemaType": "Control", "triggers": triggers})).unwrap()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefilter_collects_operations_and_fields() {
        let def = definition(json!([
            {"operation": "update", "fields": ["status"]},
            {"operation": "UPDATE", "edges": ["owners"]},
            {"operation": "create", "fields": ["status"]},
        ]));
        let pf = derive_trigger_prefilter(&def);
        assert_eq!(pf.operations, strings(&["UPDATE", "CREATE"]));
        assert_eq!(pf.fields, Some(strings(&["status", "owners"])));
    }

    #[test]
    fn unfiltered_trigger_disables_field_prefilter() {
        let def = definition(json!([
            {"operation": "UPDATE", "fields": ["status"]},
            {"operation": "UPDATE"},
        ]));
        assert_eq!(derive_trigger_prefilter(&def).fields, None);
    }

    #[test]
    fn update_without_fields_matches_any_update() {
        let def = definition(json!([{"operation": "UPDATE", "fields": []}]));
        assert!(definition_matches_trigger(&def, "UPDATE", &strings(&["anything"])));
        assert!(definition_matches_trigger(&def, "update", &[]));
        assert!(!definition_matches_trigger(&def, "CREATE", &strings(&["anything"])));
    }

    #[test]
    fn create_trigger_never_matches_update() {
        let def = definition(json!([{"operation": "CREATE"}]));
        assert!(!definition_matches_trigger(&def, "UPDATE", &strings(&["status"])));
    }

    #[test]
    fn fields_and_edges_must_intersect() {
        let def = definition(json!([{"operation": "UPDATE", "fields": ["status"], "edges": ["owners"]}]));
        assert!(definition_matches_trigger(&def, "UPDATE", &strings(&["owners"])));
        assert!(!definition_matches_trigger(&def, "UPDATE", &strings(&["title"])));
    }

    #[test]
    fn matching_triggers_yields_only_matches() {
        let def = definition(json!([
            {"operation": "UPDATE", "fields": ["status"], "expression": "true"},
            {"operation": "UPDATE", "fields": ["title"]},
        ]));
        let changed = strings(&["status"]);
        let matched: Vec<_> = matching_triggers(&def, "UPDATE", &changed).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].expression, "true");
    }

    #[test]
    fn empty_operation_matches_every_event() {
        let def = definition(json!([{"fields": ["status"]}]));
        assert!(definition_matches_trigger(&def, "DELETE", &strings(&["status"])));
    }
}
