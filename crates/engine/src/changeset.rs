//! Change-set tracking.
//!
//! Pure functions over a [`Mutation`]: which fields changed, filtered to the
//! workflow-eligible ones, and what values they are proposed to take.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{Map, Value};

/// Introspection a host mutation exposes to the engine.
pub trait Mutation: Send + Sync {
    /// Object type being mutated (e.g. `Control`).
    fn object_type(&self) -> &str;
    /// Names of fields assigned a new value.
    fn fields(&self) -> Vec<String>;
    /// Names of fields explicitly cleared.
    fn cleared_fields(&self) -> Vec<String>;
    /// New value of a field, if the mutation assigns one.
    fn field(&self, name: &str) -> Option<Value>;
}

/// Owned mutation record, built by hosts or tests from a change event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedMutation {
    /// `CREATE`, `UPDATE` or `DELETE`.
    pub operation: String,
    pub object_type: String,
    pub object_id: String,
    pub values: Map<String, Value>,
    pub cleared: Vec<String>,
    pub changed_edges: Vec<String>,
    pub added_ids: BTreeMap<String, Vec<String>>,
    pub removed_ids: BTreeMap<String, Vec<String>>,
    pub user_id: String,
}

impl RecordedMutation {
    pub fn new(operation: &str, object_type: &str, object_id: &str) -> Self {
        Self {
            operation: operation.to_ascii_uppercase(),
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            ..Default::default()
        }
    }

    pub fn set(mut self, field: &str, value: Value) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    pub fn clear(mut self, field: &str) -> Self {
        self.cleared.push(field.to_string());
        self
    }

    pub fn edge(mut self, edge: &str, added: &[&str], removed: &[&str]) -> Self {
        self.changed_edges.push(edge.to_string());
        if !added.is_empty() {
            self.added_ids
                .entry(edge.to_string())
                .or_default()
                .extend(added.iter().map(|s| s.to_string()));
        }
        if !removed.is_empty() {
            self.removed_ids
                .entry(edge.to_string())
                .or_default()
                .extend(removed.iter().map(|s| s.to_string()));
        }
        self
    }

    pub fn by(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }
}

impl Mutation for RecordedMutation {
    fn object_type(&self) -> &str {
        &self.object_type
    }

    fn fields(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn cleared_fields(&self) -> Vec<String> {
        self.cleared.clone()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// Trim, drop blanks and de-duplicate, keeping first-seen order.
pub fn normalize_strings<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter_map(|v| {
            let v = v.as_ref().trim();
            (!v.is_empty() && seen.insert(v.to_string())).then(|| v.to_string())
        })
        .collect()
}

/// Union of modified and cleared fields, restricted to `eligible` when an
/// eligibility set is known. `None` passes the union through unfiltered.
pub fn collect_changed_fields(mutation: &dyn Mutation, eligible: Option<&BTreeSet<String>>) -> Vec<String> {
    let union = normalize_strings(mutation.fields().into_iter().chain(mutation.cleared_fields()));
    match eligible {
        Some(set) => union.into_iter().filter(|f| set.contains(f)).collect(),
        None => union,
    }
}

/// New value per field, or `null` for fields that were only cleared.
pub fn build_proposed_changes(mutation: &dyn Mutation, fields: &[String]) -> Map<String, Value> {
    fields
        .iter()
        .map(|f| (f.clone(), mutation.field(f).unwrap_or(Value::Null)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eligible(fields: &[&str]) -> BTreeSet<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn changed_fields_include_cleared_and_respect_eligibility() {
        let m = RecordedMutation::new("update", "Control", "c1")
            .set("title", json!("new"))
            .set("internal_notes", json!("x"))
            .clear("description");

        let all = collect_changed_fields(&m, None);
        assert_eq!(all.len(), 3);

        let filtered = collect_changed_fields(&m, Some(&eligible(&["title", "description"])));
        assert_eq!(filtered, vec!["title".to_string(), "description".to_string()]);
    }

    #[test]
    fn empty_eligibility_set_filters_everything() {
        let m = RecordedMutation::new("UPDATE", "Control", "c1").set("title", json!("new"));
        assert!(collect_changed_fields(&m, Some(&BTreeSet::new())).is_empty());
    }

    #[test]
    fn proposed_changes_keep_cleared_fields_as_null() {
        let m = RecordedMutation::new("UPDATE", "Control", "c1")
            .set("title", json!("new"))
            .clear("description");
        let fields = vec!["title".to_string(), "description".to_string(), "status".to_string()];

        let changes = build_proposed_changes(&m, &fields);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes["title"], json!("new"));
        assert_eq!(changes["description"], Value::Null);
        assert_eq!(changes["status"], Value::Null);
    }

    #[test]
    fn normalize_trims_and_dedupes() {
        assert_eq!(normalize_strings([" a", "", "b", "a ", "  "]), vec!["a", "b"]);
    }
}
