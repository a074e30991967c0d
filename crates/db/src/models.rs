//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour beyond the
//! state machines of the status columns. Domain types (definition documents,
//! action params, objects) live in the `engine` crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Generates `as_str`, `Display` and `FromStr` for a status enum stored as
/// upper-case text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// workflow_definitions
// ---------------------------------------------------------------------------

/// A persisted, organization-scoped workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowDefinitionRow {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    /// Object type the definition applies to (e.g. `Control`).
    pub schema_type: String,
    pub active: bool,
    pub draft: bool,
    /// Minimum number of seconds between two instances for the same object.
    pub cooldown_seconds: i64,
    /// Full JSON definition document (triggers, conditions, actions, …).
    pub definition: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting a definition row.
#[derive(Debug, Clone)]
pub struct NewWorkflowDefinition {
    pub owner_id: String,
    pub name: String,
    pub schema_type: String,
    pub active: bool,
    pub cooldown_seconds: i64,
    pub definition: serde_json::Value,
}

impl NewWorkflowDefinition {
    pub fn into_row(self) -> WorkflowDefinitionRow {
        let now = Utc::now();
        WorkflowDefinitionRow {
            id: Uuid::new_v4(),
            owner_id: self.owner_id,
            name: self.name,
            schema_type: self.schema_type,
            active: self.active,
            draft: false,
            cooldown_seconds: self.cooldown_seconds,
            definition: self.definition,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_instances
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow instance.
///
/// `RUNNING → {COMPLETED, FAILED, PAUSED}`, `PAUSED → {RUNNING, FAILED}`.
/// `COMPLETED` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Completed,
    Failed,
    Paused,
}

text_enum!(InstanceState {
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Paused => "PAUSED",
});

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Running, Completed) | (Running, Failed) | (Running, Paused)
                | (Paused, Running) | (Paused, Failed)
        )
    }
}

/// A persisted workflow instance row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowInstanceRow {
    pub id: Uuid,
    pub workflow_definition_id: Uuid,
    pub owner_id: String,
    pub state: InstanceState,
    pub object_type: String,
    pub object_id: String,
    /// Approval domain the instance gates, for pre-commit approval instances.
    pub domain_key: Option<String>,
    /// Trigger change-set and execution data (JSON).
    pub context: serde_json::Value,
    /// Copy of the definition document at trigger time.
    pub definition_snapshot: serde_json::Value,
    pub workflow_proposal_id: Option<Uuid>,
    pub current_action_index: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting an instance row.
#[derive(Debug, Clone)]
pub struct NewWorkflowInstance {
    pub workflow_definition_id: Uuid,
    pub owner_id: String,
    pub state: InstanceState,
    pub object_type: String,
    pub object_id: String,
    pub domain_key: Option<String>,
    pub context: serde_json::Value,
    pub definition_snapshot: serde_json::Value,
}

impl NewWorkflowInstance {
    pub fn into_row(self) -> WorkflowInstanceRow {
        let now = Utc::now();
        WorkflowInstanceRow {
            id: Uuid::new_v4(),
            workflow_definition_id: self.workflow_definition_id,
            owner_id: self.owner_id,
            state: self.state,
            object_type: self.object_type,
            object_id: self.object_id,
            domain_key: self.domain_key,
            context: self.context,
            definition_snapshot: self.definition_snapshot,
            workflow_proposal_id: None,
            current_action_index: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_object_refs
// ---------------------------------------------------------------------------

/// Polymorphic join row binding an instance to one business object.
///
/// `object_columns` holds exactly one `<column> → <id>` pair, e.g.
/// `{"control_id": "01J…"}`; which column is set identifies the object type.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowObjectRefRow {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub owner_id: String,
    pub object_columns: Json<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowObjectRefRow {
    /// Value of a type-specific ID column, if set and non-blank.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.object_columns
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkflowObjectRef {
    pub workflow_instance_id: Uuid,
    pub owner_id: String,
    pub column: String,
    pub object_id: String,
}

impl NewWorkflowObjectRef {
    pub fn into_row(self) -> WorkflowObjectRefRow {
        let mut columns = BTreeMap::new();
        columns.insert(self.column, self.object_id);
        WorkflowObjectRefRow {
            id: Uuid::new_v4(),
            workflow_instance_id: self.workflow_instance_id,
            owner_id: self.owner_id,
            object_columns: Json(columns),
            created_at: Utc::now(),
        }
    }
}

/// Store-level predicate selecting object refs for one business object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRefFilter {
    pub column: String,
    pub object_id: String,
}

// ---------------------------------------------------------------------------
// workflow_proposals
// ---------------------------------------------------------------------------

/// `DRAFT → SUBMITTED → {APPLIED, REJECTED, SUPERSEDED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Draft,
    Submitted,
    Applied,
    Rejected,
    Superseded,
}

text_enum!(ProposalState {
    Draft => "DRAFT",
    Submitted => "SUBMITTED",
    Applied => "APPLIED",
    Rejected => "REJECTED",
    Superseded => "SUPERSEDED",
});

impl ProposalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Rejected | Self::Superseded)
    }

    pub fn can_transition_to(self, next: ProposalState) -> bool {
        use ProposalState::*;
        matches!(
            (self, next),
            (Draft, Submitted)
                | (Draft, Rejected)
                | (Submitted, Applied)
                | (Submitted, Rejected)
                | (Submitted, Superseded)
        )
    }

    /// States counted against the one-open-proposal-per-domain constraint.
    pub const OPEN: [ProposalState; 2] = [ProposalState::Draft, ProposalState::Submitted];
}

/// A pending, domain-scoped change bound to an object ref.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowProposalRow {
    pub id: Uuid,
    pub workflow_object_ref_id: Uuid,
    pub owner_id: String,
    pub object_type: String,
    pub object_id: String,
    pub domain_key: String,
    pub state: ProposalState,
    pub changes: serde_json::Value,
    pub proposed_hash: String,
    pub revision: i32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submitted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowProposalRow {
    /// Whether two rows compete for the same open slot.
    pub fn same_slot(&self, other: &WorkflowProposalRow) -> bool {
        self.owner_id == other.owner_id
            && self.object_type == other.object_type
            && self.object_id == other.object_id
            && self.domain_key == other.domain_key
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkflowProposal {
    pub workflow_object_ref_id: Uuid,
    pub owner_id: String,
    pub object_type: String,
    pub object_id: String,
    pub domain_key: String,
    pub state: ProposalState,
    pub changes: serde_json::Value,
    pub proposed_hash: String,
    pub submitted_by: Option<String>,
}

impl NewWorkflowProposal {
    pub fn into_row(self) -> WorkflowProposalRow {
        let now = Utc::now();
        let submitted = self.state == ProposalState::Submitted;
        WorkflowProposalRow {
            id: Uuid::new_v4(),
            workflow_object_ref_id: self.workflow_object_ref_id,
            owner_id: self.owner_id,
            object_type: self.object_type,
            object_id: self.object_id,
            domain_key: self.domain_key,
            state: self.state,
            changes: self.changes,
            proposed_hash: self.proposed_hash,
            revision: 1,
            submitted_at: submitted.then_some(now),
            submitted_by: if submitted { self.submitted_by } else { None },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lookup for open proposals of one object and domain.
#[derive(Debug, Clone)]
pub struct ProposalQuery {
    pub owner_id: String,
    pub object_ref_ids: Vec<Uuid>,
    pub domain_key: String,
    pub states: Vec<ProposalState>,
}

// ---------------------------------------------------------------------------
// workflow_assignments / workflow_assignment_targets
// ---------------------------------------------------------------------------

/// `PENDING → {APPROVED, REJECTED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(AssignmentStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

impl AssignmentStatus {
    pub fn is_decided(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// An approval/review task for one user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowAssignmentRow {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub owner_id: String,
    /// `approval_<action>_<user>` / `review_<action>_<user>`; unique per instance.
    pub assignment_key: String,
    pub action_key: String,
    pub status: AssignmentStatus,
    pub required: bool,
    pub label: Option<String>,
    pub metadata: serde_json::Value,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkflowAssignment {
    pub workflow_instance_id: Uuid,
    pub owner_id: String,
    pub assignment_key: String,
    pub action_key: String,
    pub required: bool,
    pub label: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewWorkflowAssignment {
    pub fn into_row(self) -> WorkflowAssignmentRow {
        let now = Utc::now();
        WorkflowAssignmentRow {
            id: Uuid::new_v4(),
            workflow_instance_id: self.workflow_instance_id,
            owner_id: self.owner_id,
            assignment_key: self.assignment_key,
            action_key: self.action_key,
            status: AssignmentStatus::Pending,
            required: self.required,
            label: self.label,
            metadata: self.metadata,
            decided_by: None,
            decided_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who an assignment was generated for.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowAssignmentTargetRow {
    pub id: Uuid,
    pub workflow_assignment_id: Uuid,
    pub owner_id: String,
    pub target_type: String,
    pub target_user_id: String,
    pub resolver_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkflowAssignmentTarget {
    pub workflow_assignment_id: Uuid,
    pub owner_id: String,
    pub target_type: String,
    pub target_user_id: String,
    pub resolver_key: Option<String>,
}

impl NewWorkflowAssignmentTarget {
    pub fn into_row(self) -> WorkflowAssignmentTargetRow {
        WorkflowAssignmentTargetRow {
            id: Uuid::new_v4(),
            workflow_assignment_id: self.workflow_assignment_id,
            owner_id: self.owner_id,
            target_type: self.target_type,
            target_user_id: self.target_user_id,
            resolver_key: self.resolver_key,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_events
// ---------------------------------------------------------------------------

/// Event types recorded on the audit log.
///
/// The `Emit*` variants are engine-internal delivery tracking records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowTriggered,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    ActionSkipped,
    ConditionEvaluated,
    AssignmentCreated,
    AssignmentResolved,
    AssignmentInvalidated,
    InstancePaused,
    InstanceResumed,
    InstanceCompleted,
    EmitFailed,
    EmitRecovered,
    EmitFailedTerminal,
}

text_enum!(EventType {
    WorkflowTriggered => "WORKFLOW_TRIGGERED",
    ActionStarted => "ACTION_STARTED",
    ActionCompleted => "ACTION_COMPLETED",
    ActionFailed => "ACTION_FAILED",
    ActionSkipped => "ACTION_SKIPPED",
    ConditionEvaluated => "CONDITION_EVALUATED",
    AssignmentCreated => "ASSIGNMENT_CREATED",
    AssignmentResolved => "ASSIGNMENT_RESOLVED",
    AssignmentInvalidated => "ASSIGNMENT_INVALIDATED",
    InstancePaused => "INSTANCE_PAUSED",
    InstanceResumed => "INSTANCE_RESUMED",
    InstanceCompleted => "INSTANCE_COMPLETED",
    EmitFailed => "EMIT_FAILED",
    EmitRecovered => "EMIT_RECOVERED",
    EmitFailedTerminal => "EMIT_FAILED_TERMINAL",
});

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowEventRow {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub owner_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    /// Reconciler claim lease; `None` when unclaimed.
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkflowEvent {
    pub workflow_instance_id: Uuid,
    pub owner_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl NewWorkflowEvent {
    pub fn into_row(self) -> WorkflowEventRow {
        let now = Utc::now();
        WorkflowEventRow {
            id: Uuid::new_v4(),
            workflow_instance_id: self.workflow_instance_id,
            owner_id: self.owner_id,
            event_type: self.event_type,
            payload: self.payload,
            locked_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_terminal_states_do_not_transition() {
        for next in [InstanceState::Running, InstanceState::Paused, InstanceState::Failed] {
            assert!(!InstanceState::Completed.can_transition_to(next));
            assert!(!InstanceState::Failed.can_transition_to(next));
        }
        assert!(InstanceState::Paused.can_transition_to(InstanceState::Running));
        assert!(!InstanceState::Paused.can_transition_to(InstanceState::Completed));
    }

    #[test]
    fn proposal_must_be_submitted_before_decision() {
        assert!(ProposalState::Draft.can_transition_to(ProposalState::Submitted));
        assert!(!ProposalState::Draft.can_transition_to(ProposalState::Applied));
        assert!(ProposalState::Submitted.can_transition_to(ProposalState::Superseded));
        assert!(ProposalState::Draft.can_transition_to(ProposalState::Rejected));
        assert!(!ProposalState::Draft.can_transition_to(ProposalState::Superseded));
        assert!(ProposalState::Applied.is_terminal());
    }

    #[test]
    fn event_type_parses_case_insensitively() {
        assert_eq!("emit_failed".parse::<EventType>().unwrap(), EventType::EmitFailed);
        assert_eq!(EventType::EmitFailedTerminal.to_string(), "EMIT_FAILED_TERMINAL");
        assert!("bogus".parse::<EventType>().is_err());
    }

    #[test]
    fn object_ref_column_ignores_blank_ids() {
        let row = NewWorkflowObjectRef {
            workflow_instance_id: Uuid::new_v4(),
            owner_id: "org".into(),
            column: "control_id".into(),
            object_id: "  ".into(),
        }
        .into_row();
        assert_eq!(row.column("control_id"), None);
    }
}
