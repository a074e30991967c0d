//! Object reference registry.
//!
//! Maps persisted object-ref rows to typed [`Object`]s, turns objects back
//! into store filters, and builds expression variables, through strategy
//! lists held by a [`WorkflowRegistry`] built once at startup and injected
//! into the engine.
//!
//! # Precedence
//!
//! Every strategy reports a [`Precedence`]. Lookups consult `Specific`
//! strategies before `Fallback` ones; among strategies of equal precedence the
//! most recently registered is consulted first. The first strategy that
//! answers wins.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::warn;

use db::models::{ObjectRefFilter, WorkflowObjectRefRow};

use crate::changeset::{collect_changed_fields, Mutation};
use crate::config::EligibilityPolicy;
use crate::targets::TargetResolverRegistry;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Business-entity type name, e.g. `Control`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectType(String);

impl ObjectType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-type field access, implemented by each supported entity.
pub trait Fielder: Send + Sync {
    fn string_field(&self, name: &str) -> Option<String>;
    fn string_slice_field(&self, name: &str) -> Option<Vec<String>>;
    /// Projection exposed to expressions as `object`.
    fn cel_value(&self) -> Value;
}

/// Loaded objects from the [`db::ObjectStore`] are JSON maps.
impl Fielder for Value {
    fn string_field(&self, name: &str) -> Option<String> {
        self.get(name)?.as_str().map(str::to_string)
    }

    fn string_slice_field(&self, name: &str) -> Option<Vec<String>> {
        let items = self.get(name)?.as_array()?;
        Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
    }

    fn cel_value(&self) -> Value {
        self.clone()
    }
}

/// A business object a workflow runs against.
#[derive(Clone)]
pub struct Object {
    pub id: String,
    pub object_type: ObjectType,
    pub node: Option<Arc<dyn Fielder>>,
}

impl Object {
    pub fn new(object_type: impl Into<ObjectType>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            node: None,
        }
    }

    pub fn with_node(mut self, node: Arc<dyn Fielder>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn string_field(&self, name: &str) -> Option<String> {
        self.node.as_ref()?.string_field(name)
    }

    pub fn string_slice_field(&self, name: &str) -> Option<Vec<String>> {
        self.node.as_ref()?.string_slice_field(name)
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("object_type", &self.object_type)
            .field("loaded", &self.node.is_some())
            .finish()
    }
}

impl From<String> for ObjectType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Fallback,
    Specific,
}

/// Claims object-ref rows it knows how to read.
pub trait ObjectRefResolver: Send + Sync {
    fn precedence(&self) -> Precedence {
        Precedence::Specific
    }
    fn resolve(&self, row: &WorkflowObjectRefRow) -> Option<Object>;
}

/// Turns an object into the filter that finds its object refs.
pub trait ObjectRefQueryBuilder: Send + Sync {
    fn precedence(&self) -> Precedence {
        Precedence::Specific
    }
    fn build(&self, object: &Object) -> Option<ObjectRefFilter>;
}

/// Change-set inputs to expression variables.
#[derive(Debug, Clone, Copy)]
pub struct CelVarsInput<'a> {
    pub changed_fields: &'a [String],
    pub changed_edges: &'a [String],
    pub added_ids: &'a BTreeMap<String, Vec<String>>,
    pub removed_ids: &'a BTreeMap<String, Vec<String>>,
    pub event_type: &'a str,
    pub user_id: &'a str,
}

/// Builds the base expression variables for an object.
pub trait CelVarsBuilder: Send + Sync {
    fn precedence(&self) -> Precedence {
        Precedence::Specific
    }
    fn build(&self, object: &Object, input: &CelVarsInput<'_>) -> Option<Map<String, Value>>;
}

/// Binds an object type to its ID column on the object-ref row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub object_type: ObjectType,
    pub column: String,
}

impl ColumnBinding {
    pub fn new(object_type: &str, column: &str) -> Self {
        Self {
            object_type: ObjectType::from(object_type),
            column: column.to_string(),
        }
    }
}

impl ObjectRefResolver for ColumnBinding {
    fn resolve(&self, row: &WorkflowObjectRefRow) -> Option<Object> {
        row.column(&self.column)
            .map(|id| Object::new(self.object_type.clone(), id))
    }
}

impl ObjectRefQueryBuilder for ColumnBinding {
    fn build(&self, object: &Object) -> Option<ObjectRefFilter> {
        (object.object_type == self.object_type).then(|| ObjectRefFilter {
            column: self.column.clone(),
            object_id: object.id.clone(),
        })
    }
}

/// The generic variable contract, used when no specific builder answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCelVars;

impl CelVarsBuilder for DefaultCelVars {
    fn precedence(&self) -> Precedence {
        Precedence::Fallback
    }

    fn build(&self, object: &Object, input: &CelVarsInput<'_>) -> Option<Map<String, Value>> {
        let projection = match &object.node {
            Some(node) => node.cel_value(),
            None => json!({ "id": object.id }),
        };
        let mut vars = Map::new();
        vars.insert("object".into(), projection);
        vars.insert("user_id".into(), json!(input.user_id));
        vars.insert("changed_fields".into(), json!(input.changed_fields));
        vars.insert("changed_edges".into(), json!(input.changed_edges));
        vars.insert("added_ids".into(), json!(input.added_ids));
        vars.insert("removed_ids".into(), json!(input.removed_ids));
        vars.insert("event_type".into(), json!(input.event_type));
        Some(vars)
    }
}

/// Strategy list kept in consultation order.
struct Strategies<T: ?Sized> {
    entries: Vec<(Precedence, u64, Arc<T>)>,
    next_seq: u64,
}

impl<T: ?Sized> Default for Strategies<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }
}

impl<T: ?Sized> Strategies<T> {
    fn push(&mut self, precedence: Precedence, strategy: Arc<T>) {
        self.entries.push((precedence, self.next_seq, strategy));
        self.next_seq += 1;
        self.entries.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.iter().map(|(_, _, s)| s)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Startup-time registrations the engine consults: object-ref strategies,
/// expression-variable builders, eligible fields and target resolvers.
pub struct WorkflowRegistry {
    resolvers: Strategies<dyn ObjectRefResolver>,
    query_builders: Strategies<dyn ObjectRefQueryBuilder>,
    cel_builders: Strategies<dyn CelVarsBuilder>,
    eligible_fields: HashMap<String, BTreeSet<String>>,
    targets: TargetResolverRegistry,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// An empty registry with only the default variable builder.
    pub fn new() -> Self {
        let mut registry = Self {
            resolvers: Strategies::default(),
            query_builders: Strategies::default(),
            cel_builders: Strategies::default(),
            eligible_fields: HashMap::new(),
            targets: TargetResolverRegistry::new(),
        };
        registry.register_cel_builder(Arc::new(DefaultCelVars));
        registry
    }

    /// Support an object type stored under `column` on object-ref rows.
    pub fn bind(mut self, object_type: &str, column: &str) -> Self {
        let binding = Arc::new(ColumnBinding::new(object_type, column));
        self.register_resolver(binding.clone());
        self.register_query_builder(binding);
        self
    }

    /// Restrict which changed fields of `object_type` may trigger workflows.
    pub fn with_eligible_fields<I, S>(mut self, object_type: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eligible_fields
            .insert(object_type.to_string(), fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn register_resolver(&mut self, resolver: Arc<dyn ObjectRefResolver>) {
        self.resolvers.push(resolver.precedence(), resolver);
    }

    pub fn register_query_builder(&mut self, builder: Arc<dyn ObjectRefQueryBuilder>) {
        self.query_builders.push(builder.precedence(), builder);
    }

    pub fn register_cel_builder(&mut self, builder: Arc<dyn CelVarsBuilder>) {
        self.cel_builders.push(builder.precedence(), builder);
    }

    pub fn targets(&self) -> &TargetResolverRegistry {
        &self.targets
    }

    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }

    /// The object an object-ref row points at.
    pub fn object_from_ref(&self, row: &WorkflowObjectRefRow) -> Result<Object, EngineError> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve(row))
            .ok_or(EngineError::MissingObjectId)
    }

    /// The store filter selecting `object`'s refs.
    pub fn object_ref_filter(&self, object: &Object) -> Result<ObjectRefFilter, EngineError> {
        if object.id.trim().is_empty() {
            return Err(EngineError::MissingObjectId);
        }
        self.query_builders
            .iter()
            .find_map(|b| b.build(object))
            .ok_or_else(|| EngineError::UnsupportedObjectType(object.object_type.to_string()))
    }

    pub fn build_cel_vars(&self, object: &Object, input: &CelVarsInput<'_>) -> Map<String, Value> {
        self.cel_builders
            .iter()
            .find_map(|b| b.build(object, input))
            .unwrap_or_default()
    }

    pub fn eligible_fields(&self, object_type: &str) -> Option<&BTreeSet<String>> {
        self.eligible_fields.get(object_type)
    }

    /// Changed, eligible fields of `mutation` under `policy`.
    pub fn changed_fields(&self, mutation: &dyn Mutation, policy: EligibilityPolicy) -> Vec<String> {
        let object_type = mutation.object_type();
        match (self.eligible_fields(object_type), policy) {
            (Some(set), _) => collect_changed_fields(mutation, Some(set)),
            (None, EligibilityPolicy::FailOpen) => {
                warn!(object_type, "no workflow-eligible fields registered; using all changed fields");
                collect_changed_fields(mutation, None)
            }
            (None, EligibilityPolicy::FailClosed) => {
                warn!(object_type, "no workflow-eligible fields registered; ignoring mutation");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::RecordedMutation;
    use db::models::NewWorkflowObjectRef;
    use uuid::Uuid;

    fn row(column: &str, id: &str) -> WorkflowObjectRefRow {
        NewWorkflowObjectRef {
            workflow_instance_id: Uuid::new_v4(),
            owner_id: "org".into(),
            column: column.into(),
            object_id: id.into(),
        }
        .into_row()
    }

    struct Control {
        status: String,
        tags: Vec<String>,
    }

    impl Fielder for Control {
        fn string_field(&self, name: &str) -> Option<String> {
            (name == "status").then(|| self.status.clone())
        }

        fn string_slice_field(&self, name: &str) -> Option<Vec<String>> {
            (name == "tags").then(|| self.tags.clone())
        }

        fn cel_value(&self) -> Value {
            json!({ "status": self.status, "tags": self.tags })
        }
    }

    struct AnyRef(&'static str);

    impl ObjectRefResolver for AnyRef {
        fn precedence(&self) -> Precedence {
            Precedence::Fallback
        }

        fn resolve(&self, row: &WorkflowObjectRefRow) -> Option<Object> {
            let id = row.object_columns.values().next()?;
            Some(Object::new(self.0, id.as_str()))
        }
    }

    #[test]
    fn bound_types_resolve_and_filter() {
        let registry = WorkflowRegistry::new().bind("Control", "control_id").bind("Policy", "policy_id");

        let obj = registry.object_from_ref(&row("policy_id", "p1")).unwrap();
        assert_eq!(obj.object_type.as_str(), "Policy");
        assert_eq!(obj.id, "p1");

        let filter = registry.object_ref_filter(&Object::new("Control", "c1")).unwrap();
        assert_eq!(filter.column, "control_id");
    }

    #[test]
    fn unclaimed_ref_is_missing_object_id() {
        let registry = WorkflowRegistry::new().bind("Control", "control_id");
        assert!(matches!(
            registry.object_from_ref(&row("risk_id", "r1")),
            Err(EngineError::MissingObjectId)
        ));
        assert!(matches!(
            registry.object_ref_filter(&Object::new("Risk", "r1")),
            Err(EngineError::UnsupportedObjectType(_))
        ));
        assert!(matches!(
            registry.object_ref_filter(&Object::new("Control", " ")),
            Err(EngineError::MissingObjectId)
        ));
    }

    #[test]
    fn specific_beats_fallback_regardless_of_order() {
        let mut registry = WorkflowRegistry::new().bind("Control", "control_id");
        registry.register_resolver(Arc::new(AnyRef("Unknown")));

        let obj = registry.object_from_ref(&row("control_id", "c1")).unwrap();
        assert_eq!(obj.object_type.as_str(), "Control");

        let obj = registry.object_from_ref(&row("risk_id", "r1")).unwrap();
        assert_eq!(obj.object_type.as_str(), "Unknown");
    }

    #[test]
    fn latest_registration_wins_within_precedence() {
        let registry = WorkflowRegistry::new()
            .bind("Control", "object_id")
            .bind("Subcontrol", "object_id");
        let obj = registry.object_from_ref(&row("object_id", "x")).unwrap();
        assert_eq!(obj.object_type.as_str(), "Subcontrol");
    }

    #[test]
    fn default_vars_follow_contract_and_typed_fielder() {
        let registry = WorkflowRegistry::new();
        let obj = Object::new("Control", "c1").with_node(Arc::new(Control {
            status: "DRAFT".into(),
            tags: vec!["soc2".into()],
        }));
        let fields = vec!["status".to_string()];
        let added = BTreeMap::new();
        let input = CelVarsInput {
            changed_fields: &fields,
            changed_edges: &[],
            added_ids: &added,
            removed_ids: &added,
            event_type: "UPDATE",
            user_id: "u1",
        };

        let vars = registry.build_cel_vars(&obj, &input);
        for name in crate::cel::BASE_VARIABLES {
            assert!(vars.contains_key(name), "missing {name}");
        }
        assert_eq!(vars["object"]["status"], json!("DRAFT"));
        assert_eq!(obj.string_field("status").as_deref(), Some("DRAFT"));
        assert_eq!(obj.string_slice_field("tags"), Some(vec!["soc2".to_string()]));
    }

    #[test]
    fn eligibility_policy_applies_only_without_registration() {
        let m = RecordedMutation::new("UPDATE", "Control", "c1")
            .set("status", json!("x"))
            .set("notes", json!("y"));

        let open = WorkflowRegistry::new();
        assert_eq!(open.changed_fields(&m, EligibilityPolicy::FailOpen).len(), 2);
        assert!(open.changed_fields(&m, EligibilityPolicy::FailClosed).is_empty());

        let scoped = WorkflowRegistry::new().with_eligible_fields("Control", ["status"]);
        assert_eq!(scoped.changed_fields(&m, EligibilityPolicy::FailClosed), vec!["status".to_string()]);
    }
}
