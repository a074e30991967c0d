//! Domain models: the workflow definition document, action params and the
//! JSON blobs stored on instances, events and assignments.
//!
//! Persistence rows live in `db::models`; these are the typed views over the
//! JSON columns of those rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use db::models::EventType;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Kinds of action a definition may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    RequestApproval,
    RequestReview,
    Notify,
    Webhook,
    UpdateField,
    Integration,
    CreateObject,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        Self::RequestApproval,
        Self::RequestReview,
        Self::Notify,
        Self::Webhook,
        Self::UpdateField,
        Self::Integration,
        Self::CreateObject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestApproval => "REQUEST_APPROVAL",
            Self::RequestReview => "REQUEST_REVIEW",
            Self::Notify => "NOTIFY",
            Self::Webhook => "WEBHOOK",
            Self::UpdateField => "UPDATE_FIELD",
            Self::Integration => "INTEGRATION",
            Self::CreateObject => "CREATE_OBJECT",
        }
    }

    /// Approval and review actions pause the instance until decided.
    pub fn is_gated(&self) -> bool {
        matches!(self, Self::RequestApproval | Self::RequestReview)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown action type: {s}"))
    }
}

/// When an approval gates a change relative to its commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalTiming {
    /// The change is held as a proposal until approved.
    #[default]
    PreCommit,
    /// The change applies immediately and is reviewed afterwards.
    PostCommit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalSubmissionMode {
    /// Proposals start as `DRAFT` and must be submitted.
    #[default]
    ManualSubmit,
    AutoSubmit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowKind {
    #[default]
    Approval,
    Lifecycle,
    Notification,
}

// ---------------------------------------------------------------------------
// Definition document
// ---------------------------------------------------------------------------

/// A versioned workflow definition as stored in `workflow_definitions.definition`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowDefinitionDocument {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub schema_type: String,
    pub workflow_kind: WorkflowKind,
    pub approval_submission_mode: ApprovalSubmissionMode,
    #[serde(alias = "approval_timing")]
    pub approval_timing: ApprovalTiming,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub triggers: Vec<WorkflowTrigger>,
    pub conditions: Vec<WorkflowCondition>,
    pub actions: Vec<WorkflowAction>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl WorkflowDefinitionDocument {
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        Self::deserialize(value).map_err(EngineError::InvalidDefinition)
    }

    pub fn action(&self, key: &str) -> Option<(usize, &WorkflowAction)> {
        self.actions.iter().enumerate().find(|(_, a)| a.key == key)
    }

    /// The document an instance runs: under `POST_COMMIT` the change has
    /// already applied, so approvals become reviews.
    pub fn execution_snapshot(&self) -> Self {
        let mut doc = self.clone();
        if doc.approval_timing == ApprovalTiming::PostCommit {
            for action in &mut doc.actions {
                if action.action_type() == Some(ActionType::RequestApproval) {
                    action.kind = ActionType::RequestReview.to_string();
                }
            }
        }
        doc
    }

    /// Whether a matching update is held as proposals instead of applying.
    pub fn gates_before_commit(&self) -> bool {
        self.approval_timing == ApprovalTiming::PreCommit && self.has_approval_action()
    }

    /// Whether any action is a `REQUEST_APPROVAL`.
    pub fn has_approval_action(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.action_type() == Some(ActionType::RequestApproval))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowTrigger {
    /// `CREATE`, `UPDATE` or `DELETE`; empty matches any operation.
    pub operation: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub object_type: String,
    pub fields: Vec<String>,
    pub edges: Vec<String>,
    /// Optional guard evaluated in the base expression scope.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl WorkflowTrigger {
    /// The trigger's field and edge names, in declaration order.
    pub fn field_filter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().chain(self.edges.iter()).map(String::as_str)
    }

    pub fn has_field_filter(&self) -> bool {
        self.field_filter().any(|f| !f.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowCondition {
    pub expression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowAction {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Value,
    /// Optional guard evaluated in the action scope; false skips the action.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub when: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl WorkflowAction {
    pub fn action_type(&self) -> Option<ActionType> {
        self.kind.parse().ok()
    }

    /// Parse `params` into a typed struct; absent params give `T::default()`.
    pub fn parse_params<T: for<'de> Deserialize<'de> + Default>(&self) -> Result<T, EngineError> {
        if self.params.is_null() {
            return Ok(T::default());
        }
        T::deserialize(&self.params).map_err(|source| EngineError::InvalidActionParams {
            action_key: self.key.clone(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Targets and action params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    User,
    Group,
    Role,
    Resolver,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "USER"),
            Self::Group => write!(f, "GROUP"),
            Self::Role => write!(f, "ROLE"),
            Self::Resolver => write!(f, "RESOLVER"),
        }
    }
}

/// Who an approval, review or notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// User ID, group ID or role name depending on `target_type`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolver_key: String,
}

impl TargetConfig {
    pub fn user(id: impl Into<String>) -> Self {
        Self { target_type: TargetType::User, id: id.into(), resolver_key: String::new() }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self { target_type: TargetType::Group, id: id.into(), resolver_key: String::new() }
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self { target_type: TargetType::Role, id: role.into(), resolver_key: String::new() }
    }

    pub fn resolver(key: impl Into<String>) -> Self {
        Self { target_type: TargetType::Resolver, id: String::new(), resolver_key: key.into() }
    }
}

/// Params of `REQUEST_APPROVAL` and `REQUEST_REVIEW`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalActionParams {
    pub targets: Vec<TargetConfig>,
    /// Defaults to `true`.
    pub required: Option<bool>,
    pub required_count: i64,
    pub label: String,
    /// Fields gated by this approval; defines its domain.
    pub fields: Vec<String>,
}

impl ApprovalActionParams {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }

    /// Approvals needed. `0` means every required assignment must approve;
    /// optional approvals with no explicit count need one.
    pub fn quorum(&self) -> usize {
        let count = self.required_count.max(0) as usize;
        if count == 0 && !self.is_required() {
            1
        } else {
            count
        }
    }
}

/// Params of `NOTIFY`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyActionParams {
    pub targets: Vec<TargetConfig>,
    pub title: String,
    pub body: String,
    pub channels: Vec<String>,
    pub data: Map<String, Value>,
}

/// Params of `UPDATE_FIELD`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldUpdateActionParams {
    pub updates: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Instance context and event payloads
// ---------------------------------------------------------------------------

/// Trigger change-set and execution bookkeeping stored on the instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowInstanceContext {
    pub workflow_definition_id: String,
    pub object_type: String,
    pub object_id: String,
    pub trigger_event_type: String,
    pub trigger_changed_fields: Vec<String>,
    pub trigger_changed_edges: Vec<String>,
    pub trigger_added_ids: BTreeMap<String, Vec<String>>,
    pub trigger_removed_ids: BTreeMap<String, Vec<String>>,
    pub trigger_user_id: String,
    pub trigger_proposed_changes: Map<String, Value>,
    /// Output of completed actions, keyed by action key.
    pub data: Map<String, Value>,
}

impl WorkflowInstanceContext {
    pub fn from_value(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or_default()
    }
}

/// Payload persisted on every `workflow_events` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEventPayload {
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action_key: String,
    #[serde(default)]
    pub details: Value,
}

/// Approval bookkeeping stored on each assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentApprovalMetadata {
    pub action_key: String,
    pub action_index: usize,
    pub required: bool,
    pub required_count: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proposed_hash: String,
}

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// The authenticated principal a mutation is performed on behalf of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub organization_id: String,
    pub subject_id: String,
}

impl Caller {
    pub fn new(organization_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            subject_id: subject_id.into(),
        }
    }

    pub fn require_organization(&self) -> Result<&str, EngineError> {
        if self.organization_id.trim().is_empty() {
            return Err(EngineError::MissingOrganization);
        }
        Ok(&self.organization_id)
    }

    pub fn require_subject(&self) -> Result<&str, EngineError> {
        if self.subject_id.trim().is_empty() {
            return Err(EngineError::NoAuthenticatedCaller);
        }
        Ok(&self.subject_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_accepts_snake_case_timing() {
        let doc = WorkflowDefinitionDocument::from_value(&json!({
            "schemaType": "Control",
            "approval_timing": "POST_COMMIT",
            "actions": [{"key": "a", "type": "notify"}]
        }))
        .unwrap();

        assert_eq!(doc.approval_timing, ApprovalTiming::PostCommit);
        assert_eq!(doc.actions[0].action_type(), Some(ActionType::Notify));
        assert_eq!(doc.approval_submission_mode, ApprovalSubmissionMode::ManualSubmit);
    }

    #[test]
    fn optional_approval_defaults_to_single_approver() {
        let params: ApprovalActionParams = serde_json::from_value(json!({"required": false})).unwrap();
        assert_eq!(params.quorum(), 1);

        let params: ApprovalActionParams = serde_json::from_value(json!({"required_count": -4})).unwrap();
        assert!(params.is_required());
        assert_eq!(params.quorum(), 0);
    }

    #[test]
    fn post_commit_snapshot_turns_approvals_into_reviews() {
        let doc = WorkflowDefinitionDocument::from_value(&json!({
            "schemaType": "Control",
            "approvalTiming": "POST_COMMIT",
            "actions": [{"key": "a", "type": "REQUEST_APPROVAL"}, {"key": "n", "type": "NOTIFY"}]
        }))
        .unwrap();
        assert!(!doc.gates_before_commit());

        let snapshot = doc.execution_snapshot();
        assert_eq!(snapshot.actions[0].action_type(), Some(ActionType::RequestReview));
        assert_eq!(snapshot.actions[1].action_type(), Some(ActionType::Notify));
    }

    #[test]
    fn caller_without_org_is_rejected() {
        let caller = Caller::new("", "user-1");
        assert!(matches!(caller.require_organization(), Err(EngineError::MissingOrganization)));
    }
}
