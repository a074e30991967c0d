//! Approval domains and proposal hashing.
//!
//! A domain is the set of fields one `REQUEST_APPROVAL` action gates. Changes
//! are partitioned per domain so each domain gets its own proposal, keyed by
//! [`derive_domain_key`] and de-duplicated by [`compute_proposal_hash`].

use std::collections::HashSet;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::changeset::normalize_strings;
use crate::models::{ActionType, ApprovalActionParams, WorkflowDefinitionDocument};
use crate::EngineError;

/// Changes belonging to one approval domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainChanges {
    pub domain_key: String,
    pub fields: Vec<String>,
    pub changes: Map<String, Value>,
}

/// `<type>:<sorted,fields>`; independent of field order.
pub fn derive_domain_key(object_type: &str, fields: &[String]) -> String {
    let mut sorted: Vec<&str> = fields.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let joined = sorted.join(",");

    match (object_type.is_empty(), joined.is_empty()) {
        (_, true) => object_type.to_string(),
        (true, false) => joined,
        (false, false) => format!("{object_type}:{joined}"),
    }
}

/// Sorted field sets of the definition's approval actions, one per distinct
/// domain.
///
/// An action whose params do not parse aborts the whole call.
pub fn approval_domains(definition: &WorkflowDefinitionDocument) -> Result<Vec<Vec<String>>, EngineError> {
    let mut seen = HashSet::new();
    let mut domains = Vec::new();

    for action in &definition.actions {
        if action.action_type() != Some(ActionType::RequestApproval) {
            continue;
        }

        let params: ApprovalActionParams = if action.params.is_null() {
            ApprovalActionParams::default()
        } else {
            serde_json::from_value(action.params.clone()).map_err(|source| {
                EngineError::ApprovalParamsInvalid {
                    action_key: action.key.clone(),
                    source,
                }
            })?
        };

        let mut fields = normalize_strings(&params.fields);
        fields.sort_unstable();
        if fields.is_empty() {
            continue;
        }
        if seen.insert(derive_domain_key(&definition.schema_type, &fields)) {
            domains.push(fields);
        }
    }

    Ok(domains)
}

/// Project `changes` onto `fields`.
///
/// `None` when `changes` is empty; an empty map when nothing overlaps.
pub fn filter_changes_for_domain(changes: &Map<String, Value>, fields: &[String]) -> Option<Map<String, Value>> {
    if changes.is_empty() {
        return None;
    }
    Some(
        fields
            .iter()
            .filter_map(|f| changes.get(f).map(|v| (f.clone(), v.clone())))
            .collect(),
    )
}

/// Per-domain changes, dropping domains with no overlap.
pub fn split_changes_by_domains(
    object_type: &str,
    changes: &Map<String, Value>,
    domains: &[Vec<String>],
) -> Vec<DomainChanges> {
    domains
        .iter()
        .filter_map(|fields| {
            let projected = filter_changes_for_domain(changes, fields)?;
            (!projected.is_empty()).then(|| DomainChanges {
                domain_key: derive_domain_key(object_type, fields),
                fields: fields.clone(),
                changes: projected,
            })
        })
        .collect()
}

/// Domains of `definition` touched by `changes`, or a single fallback domain
/// over every changed field when none is.
pub fn domain_changes_for_definition(
    definition: &WorkflowDefinitionDocument,
    object_type: &str,
    changes: &Map<String, Value>,
) -> Result<Vec<DomainChanges>, EngineError> {
    if changes.is_empty() {
        return Ok(Vec::new());
    }

    let domains = approval_domains(definition)?;
    let split = split_changes_by_domains(object_type, changes, &domains);
    if !split.is_empty() {
        return Ok(split);
    }

    let mut fields: Vec<String> = changes.keys().cloned().collect();
    fields.sort();
    Ok(vec![DomainChanges {
        domain_key: derive_domain_key(object_type, &fields),
        fields,
        changes: changes.clone(),
    }])
}

/// Hex SHA-256 of the canonical (key-sorted) JSON of `changes`.
pub fn compute_proposal_hash(changes: &Map<String, Value>) -> Result<String, EngineError> {
    let canonical = canonicalize(&Value::Object(changes.clone()));
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// serde_json's default Map is ordered, but with `preserve_order` enabled by
// any crate in the graph it is not; sort explicitly.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn definition(actions: Value) -> WorkflowDefinitionDocument {
        WorkflowDefinitionDocument::from_value(&json!({
            "schemaType": "Control",
            "actions": actions,
        }))
        .unwrap()
    }

    fn changes(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn domain_key_is_order_independent() {
        assert_eq!(
            derive_domain_key("Control", &strings(&["text", "description"])),
            derive_domain_key("Control", &strings(&["description", "text"])),
        );
        assert_eq!(derive_domain_key("Control", &strings(&["b", "a"])), "Control:a,b");
    }

    #[test]
    fn domain_key_edge_cases() {
        assert_eq!(derive_domain_key("Control", &[]), "Control");
        assert_eq!(derive_domain_key("", &[]), "");
        assert_eq!(derive_domain_key("", &strings(&["b", "a"])), "a,b");
    }

    #[test]
    fn approval_domains_collapse_duplicates() {
        let def = definition(json!([
            {"key": "a1", "type": "REQUEST_APPROVAL", "params": {"fields": ["status", " title"]}},
            {"key": "a2", "type": "REQUEST_APPROVAL", "params": {"fields": ["title", "status", "title"]}},
            {"key": "n1", "type": "NOTIFY", "params": {"fields": ["ignored"]}},
            {"key": "a3", "type": "REQUEST_APPROVAL", "params": {"fields": ["description"]}},
        ]));

        let domains = approval_domains(&def).unwrap();
        assert_eq!(domains, vec![strings(&["status", "title"]), strings(&["description"])]);
    }

    #[test]
    fn domain_fields_are_sorted_regardless_of_declaration_order() {
        let def = definition(json!([
            {"key": "a1", "type": "REQUEST_APPROVAL", "params": {"fields": ["status", "priority"]}},
        ]));
        assert_eq!(approval_domains(&def).unwrap(), vec![strings(&["priority", "status"])]);

        let result = domain_changes_for_definition(&def, "Control", &changes(json!({"status": "approved"}))).unwrap();
        assert_eq!(result[0].fields, strings(&["priority", "status"]));
        assert_eq!(result[0].domain_key, "Control:priority,status");
    }

    #[test]
    fn malformed_approval_params_abort() {
        let def = definition(json!([
            {"key": "ok", "type": "REQUEST_APPROVAL", "params": {"fields": ["status"]}},
            {"key": "bad", "type": "REQUEST_APPROVAL", "params": {"fields": "status"}},
        ]));

        let err = approval_domains(&def).unwrap_err();
        assert!(matches!(err, EngineError::ApprovalParamsInvalid { ref action_key, .. } if action_key == "bad"));
    }

    #[test]
    fn filter_distinguishes_empty_input_from_no_overlap() {
        assert_eq!(filter_changes_for_domain(&Map::new(), &strings(&["a"])), None);
        assert_eq!(
            filter_changes_for_domain(&changes(json!({"a": 1})), &[]),
            Some(Map::new())
        );
        assert_eq!(
            filter_changes_for_domain(&changes(json!({"a": 1, "b": 2})), &strings(&["b"])),
            Some(changes(json!({"b": 2})))
        );
    }

    #[test]
    fn fallback_domain_covers_all_changes() {
        let def = definition(json!([{"key": "n", "type": "NOTIFY"}]));
        let result =
            domain_changes_for_definition(&def, "Control", &changes(json!({"title": "x", "status": null}))).unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].domain_key, "Control:status,title");
        assert_eq!(result[0].changes.len(), 2);
    }

    #[test]
    fn changes_split_across_domains() {
        let def = definition(json!([
            {"key": "a1", "type": "REQUEST_APPROVAL", "params": {"fields": ["status"]}},
            {"key": "a2", "type": "REQUEST_APPROVAL", "params": {"fields": ["title"]}},
            {"key": "a3", "type": "REQUEST_APPROVAL", "params": {"fields": ["owner"]}},
        ]));
        let result =
            domain_changes_for_definition(&def, "Control", &changes(json!({"title": "x", "status": "done"}))).unwrap();

        let keys: Vec<&str> = result.iter().map(|d| d.domain_key.as_str()).collect();
        assert_eq!(keys, vec!["Control:status", "Control:title"]);
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut a = Map::new();
        a.insert("b".into(), json!({"y": 1, "x": [2, {"q": 1, "p": 0}]}));
        a.insert("a".into(), json!("v"));
        let mut b = Map::new();
        b.insert("a".into(), json!("v"));
        b.insert("b".into(), json!({"x": [2, {"p": 0, "q": 1}], "y": 1}));

        let ha = compute_proposal_hash(&a).unwrap();
        assert_eq!(ha, compute_proposal_hash(&b).unwrap());
        assert_eq!(ha, compute_proposal_hash(&a).unwrap());
        assert_eq!(ha.len(), 64);
        assert_ne!(ha, compute_proposal_hash(&changes(json!({"a": "w"}))).unwrap());
    }
}
