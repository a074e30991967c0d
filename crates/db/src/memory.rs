//! In-memory implementations of the store traits.
//!
//! Used by tests and by embedders that do not need durability. Transactions
//! stage writes against a private copy of the state and apply them to the
//! shared state in one step on commit, so a rolled-back or failed transaction
//! leaves nothing behind. Uniqueness constraints mirror the Postgres schema.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::*;
use crate::store::*;
use crate::DbError;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    Commit,
    CreateInstance,
    CreateObjectRef,
    CreateProposal,
    CreateEvent,
    UpdateEvent,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    definitions: HashMap<Uuid, WorkflowDefinitionRow>,
    instances: HashMap<Uuid, WorkflowInstanceRow>,
    object_refs: HashMap<Uuid, WorkflowObjectRefRow>,
    proposals: HashMap<Uuid, WorkflowProposalRow>,
    assignments: HashMap<Uuid, WorkflowAssignmentRow>,
    assignment_targets: HashMap<Uuid, WorkflowAssignmentTargetRow>,
    events: HashMap<Uuid, WorkflowEventRow>,
}

impl MemoryState {
    fn insert_proposal(&mut self, row: WorkflowProposalRow) -> Result<(), DbError> {
        if !row.state.is_terminal() {
            let taken = self
                .proposals
                .values()
                .any(|p| !p.state.is_terminal() && p.same_slot(&row));
            if taken {
                return Err(DbError::Conflict(format!(
                    "open proposal already exists for domain '{}'",
                    row.domain_key
                )));
            }
        }
        self.proposals.insert(row.id, row);
        Ok(())
    }

    fn proposal_ids_for_instances(&self, instance_ids: &[Uuid]) -> Vec<Uuid> {
        let ids: HashSet<&Uuid> = instance_ids.iter().collect();
        let ref_ids: HashSet<Uuid> = self
            .object_refs
            .values()
            .filter(|r| ids.contains(&r.workflow_instance_id))
            .map(|r| r.id)
            .collect();
        let mut out: Vec<Uuid> = self
            .proposals
            .values()
            .filter(|p| ref_ids.contains(&p.workflow_object_ref_id))
            .map(|p| p.id)
            .chain(
                self.instances
                    .values()
                    .filter(|i| ids.contains(&i.id))
                    .filter_map(|i| i.workflow_proposal_id),
            )
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// A write staged inside a [`MemoryTx`].
#[derive(Debug, Clone)]
enum StagedOp {
    InsertInstance(WorkflowInstanceRow),
    InsertObjectRef(WorkflowObjectRefRow),
    InsertProposal(WorkflowProposalRow),
    SetInstanceProposal { instance_id: Uuid, proposal_id: Uuid },
    DeleteAssignmentTargets(Vec<Uuid>),
    DeleteAssignments(Vec<Uuid>),
    DeleteProposals(Vec<Uuid>),
    DeleteObjectRefs(Vec<Uuid>),
    DeleteEvents(Vec<Uuid>),
    DeleteInstances(Vec<Uuid>),
}

impl StagedOp {
    /// Apply to `state`, returning the number of affected rows.
    fn apply(&self, state: &mut MemoryState) -> Result<u64, DbError> {
        fn retain<T>(map: &mut HashMap<Uuid, T>, keep: impl Fn(&T) -> bool) -> u64 {
            let before = map.len();
            map.retain(|_, v| keep(v));
            (before - map.len()) as u64
        }

        Ok(match self {
            Self::InsertInstance(row) => {
                state.instances.insert(row.id, row.clone());
                1
            }
            Self::InsertObjectRef(row) => {
                state.object_refs.insert(row.id, row.clone());
                1
            }
            Self::InsertProposal(row) => {
                state.insert_proposal(row.clone())?;
                1
            }
            Self::SetInstanceProposal { instance_id, proposal_id } => {
                let instance = state.instances.get_mut(instance_id).ok_or(DbError::NotFound)?;
                instance.workflow_proposal_id = Some(*proposal_id);
                instance.updated_at = Utc::now();
                1
            }
            Self::DeleteAssignmentTargets(instance_ids) => {
                let assignment_ids: HashSet<Uuid> = state
                    .assignments
                    .values()
                    .filter(|a| instance_ids.contains(&a.workflow_instance_id))
                    .map(|a| a.id)
                    .collect();
                retain(&mut state.assignment_targets, |t| {
                    !assignment_ids.contains(&t.workflow_assignment_id)
                })
            }
            Self::DeleteAssignments(instance_ids) => {
                retain(&mut state.assignments, |a| !instance_ids.contains(&a.workflow_instance_id))
            }
            Self::DeleteProposals(ids) => retain(&mut state.proposals, |p| !ids.contains(&p.id)),
            Self::DeleteObjectRefs(instance_ids) => {
                retain(&mut state.object_refs, |r| !instance_ids.contains(&r.workflow_instance_id))
            }
            Self::DeleteEvents(instance_ids) => {
                retain(&mut state.events, |e| !instance_ids.contains(&e.workflow_instance_id))
            }
            Self::DeleteInstances(ids) => retain(&mut state.instances, |i| !ids.contains(&i.id)),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Shared, cloneable in-memory [`WorkflowStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    failures: Arc<Mutex<HashSet<FailPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call at `point` fail until [`Self::clear_failures`].
    pub fn inject_failure(&self, point: FailPoint) {
        self.failures.lock().insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn check(&self, point: FailPoint) -> Result<(), DbError> {
        check_failure(&self.failures, point)
    }

    /// Insert a fully-formed instance row, bypassing the transactional path.
    pub fn seed_instance(&self, row: WorkflowInstanceRow) {
        self.state.lock().instances.insert(row.id, row);
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    pub fn object_ref_count(&self) -> usize {
        self.state.lock().object_refs.len()
    }

    pub fn proposal_count(&self) -> usize {
        self.state.lock().proposals.len()
    }

    /// Drop a definition row entirely, as a hard delete would.
    pub fn remove_definition(&self, id: Uuid) {
        self.state.lock().definitions.remove(&id);
    }
}

fn check_failure(failures: &Mutex<HashSet<FailPoint>>, point: FailPoint) -> Result<(), DbError> {
    if failures.lock().contains(&point) {
        return Err(DbError::Injected(format!("{point:?}")));
    }
    Ok(())
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, DbError> {
        self.check(FailPoint::Begin)?;
        Ok(MemoryTx {
            shared: Arc::clone(&self.state),
            failures: Arc::clone(&self.failures),
            working: self.state.lock().clone(),
            ops: Vec::new(),
        })
    }

    async fn create_definition(&self, new: NewWorkflowDefinition) -> Result<WorkflowDefinitionRow, DbError> {
        let row = new.into_row();
        self.state.lock().definitions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinitionRow, DbError> {
        self.state.lock().definitions.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinitionRow>, DbError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .definitions
            .values()
            .filter(|d| d.owner_id == filter.owner_id)
            .filter(|d| d.schema_type.eq_ignore_ascii_case(&filter.schema_type))
            .filter(|d| d.active && !d.draft && d.deleted_at.is_none())
            .filter(|d| match &filter.operation {
                Some(op) => definition_has_operation(&d.definition, op),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }

    async fn soft_delete_definition(&self, id: Uuid) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let row = state.definitions.get_mut(&id).ok_or(DbError::NotFound)?;
        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstanceRow, DbError> {
        self.state.lock().instances.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn find_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstanceRow>, DbError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .instances
            .values()
            .filter(|i| i.owner_id == filter.owner_id)
            .filter(|i| i.object_type == filter.object_type && i.object_id == filter.object_id)
            .filter(|i| filter.workflow_definition_id.map_or(true, |d| i.workflow_definition_id == d))
            .filter(|i| filter.domain_key.as_ref().map_or(true, |k| i.domain_key.as_ref() == Some(k)))
            .filter(|i| filter.states.is_empty() || filter.states.contains(&i.state))
            .filter(|i| filter.created_after.map_or(true, |t| i.created_at > t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_instance_state(&self, id: Uuid, state: InstanceState) -> Result<(), DbError> {
        let mut guard = self.state.lock();
        let row = guard.instances.get_mut(&id).ok_or(DbError::NotFound)?;
        row.state = state;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn update_instance_progress(&self, id: Uuid, current_action_index: i32, context: Value) -> Result<(), DbError> {
        let mut guard = self.state.lock();
        let row = guard.instances.get_mut(&id).ok_or(DbError::NotFound)?;
        row.current_action_index = current_action_index;
        row.context = context;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn find_orphan_instance_ids(&self, owner_id: Option<&str>) -> Result<Vec<Uuid>, DbError> {
        let state = self.state.lock();
        let mut ids: Vec<Uuid> = state
            .instances
            .values()
            .filter(|i| owner_id.map_or(true, |o| i.owner_id == o))
            .filter(|i| match state.definitions.get(&i.workflow_definition_id) {
                None => true,
                Some(d) => d.deleted_at.is_some(),
            })
            .map(|i| i.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn find_object_refs(&self, owner_id: &str, filter: &ObjectRefFilter) -> Result<Vec<WorkflowObjectRefRow>, DbError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .object_refs
            .values()
            .filter(|r| r.owner_id == owner_id)
            .filter(|r| r.column(&filter.column) == Some(filter.object_id.as_str()))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn object_refs_for_instance(&self, instance_id: Uuid) -> Result<Vec<WorkflowObjectRefRow>, DbError> {
        let state = self.state.lock();
        Ok(state
            .object_refs
            .values()
            .filter(|r| r.workflow_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn get_proposal(&self, id: Uuid) -> Result<WorkflowProposalRow, DbError> {
        self.state.lock().proposals.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn find_proposals(&self, query: &ProposalQuery) -> Result<Vec<WorkflowProposalRow>, DbError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .proposals
            .values()
            .filter(|p| p.owner_id == query.owner_id && p.domain_key == query.domain_key)
            .filter(|p| query.object_ref_ids.contains(&p.workflow_object_ref_id))
            .filter(|p| query.states.is_empty() || query.states.contains(&p.state))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn update_proposal(&self, row: &WorkflowProposalRow) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.proposals.contains_key(&row.id) {
            return Err(DbError::NotFound);
        }
        let mut updated = row.clone();
        updated.updated_at = Utc::now();
        state.proposals.insert(row.id, updated);
        Ok(())
    }

    async fn create_assignment(&self, new: NewWorkflowAssignment) -> Result<WorkflowAssignmentRow, DbError> {
        let mut state = self.state.lock();
        let duplicate = state.assignments.values().any(|a| {
            a.workflow_instance_id == new.workflow_instance_id && a.assignment_key == new.assignment_key
        });
        if duplicate {
            return Err(DbError::Conflict(format!("assignment '{}' already exists", new.assignment_key)));
        }
        let row = new.into_row();
        state.assignments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_assignment_target(&self, new: NewWorkflowAssignmentTarget) -> Result<WorkflowAssignmentTargetRow, DbError> {
        let row = new.into_row();
        self.state.lock().assignment_targets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_assignment(&self, id: Uuid) -> Result<WorkflowAssignmentRow, DbError> {
        self.state.lock().assignments.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_assignments(&self, instance_id: Uuid) -> Result<Vec<WorkflowAssignmentRow>, DbError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .assignments
            .values()
            .filter(|a| a.workflow_instance_id == instance_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.assignment_key.cmp(&b.assignment_key)));
        Ok(rows)
    }

    async fn list_assignment_targets(&self, assignment_id: Uuid) -> Result<Vec<WorkflowAssignmentTargetRow>, DbError> {
        let state = self.state.lock();
        Ok(state
            .assignment_targets
            .values()
            .filter(|t| t.workflow_assignment_id == assignment_id)
            .cloned()
            .collect())
    }

    async fn update_assignment(&self, row: &WorkflowAssignmentRow) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.assignments.contains_key(&row.id) {
            return Err(DbError::NotFound);
        }
        let mut updated = row.clone();
        updated.updated_at = Utc::now();
        state.assignments.insert(row.id, updated);
        Ok(())
    }

    async fn create_event(&self, new: NewWorkflowEvent) -> Result<WorkflowEventRow, DbError> {
        self.check(FailPoint::CreateEvent)?;
        let mut row = new.into_row();
        let mut state = self.state.lock();
        // Keep audit order stable when the clock does not advance between events.
        if let Some(last) = state.events.values().map(|e| e.created_at).max() {
            if row.created_at <= last {
                row.created_at = last + chrono::Duration::microseconds(1);
            }
        }
        state.events.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<WorkflowEventRow>, DbError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .events
            .values()
            .filter(|e| e.workflow_instance_id == instance_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }

    async fn claim_events(&self, event_type: EventType, limit: usize, lease: Duration) -> Result<Vec<WorkflowEventRow>, DbError> {
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut state = self.state.lock();
        let mut candidates: Vec<_> = state
            .events
            .values()
            .filter(|e| e.event_type == event_type)
            .filter(|e| e.locked_until.map_or(true, |t| t <= now))
            .map(|e| (e.created_at, e.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(event) = state.events.get_mut(&id) {
                event.locked_until = Some(until);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_event(&self, id: Uuid, event_type: EventType, payload: Value) -> Result<(), DbError> {
        self.check(FailPoint::UpdateEvent)?;
        let mut state = self.state.lock();
        let event = state.events.get_mut(&id).ok_or(DbError::NotFound)?;
        event.event_type = event_type;
        event.payload = payload;
        event.locked_until = None;
        event.updated_at = Utc::now();
        Ok(())
    }
}

/// True when the document's triggers allow `operation` (or any operation).
fn definition_has_operation(definition: &Value, operation: &str) -> bool {
    let Some(triggers) = definition.get("triggers").and_then(Value::as_array) else {
        return false;
    };
    triggers.iter().any(|t| {
        match t.get("operation").and_then(Value::as_str).map(str::trim) {
            None | Some("") => true,
            Some(op) => op.eq_ignore_ascii_case(operation),
        }
    })
}

// ---------------------------------------------------------------------------
// MemoryTx
// ---------------------------------------------------------------------------

/// Transaction over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    shared: Arc<Mutex<MemoryState>>,
    failures: Arc<Mutex<HashSet<FailPoint>>>,
    working: MemoryState,
    ops: Vec<StagedOp>,
}

impl MemoryTx {
    fn stage(&mut self, op: StagedOp) -> Result<u64, DbError> {
        let affected = op.apply(&mut self.working)?;
        self.ops.push(op);
        Ok(affected)
    }
}

#[async_trait]
impl WorkflowTx for MemoryTx {
    async fn create_instance(&mut self, new: NewWorkflowInstance) -> Result<WorkflowInstanceRow, DbError> {
        check_failure(&self.failures, FailPoint::CreateInstance)?;
        let row = new.into_row();
        self.stage(StagedOp::InsertInstance(row.clone()))?;
        Ok(row)
    }

    async fn create_object_ref(&mut self, new: NewWorkflowObjectRef) -> Result<WorkflowObjectRefRow, DbError> {
        check_failure(&self.failures, FailPoint::CreateObjectRef)?;
        let row = new.into_row();
        self.stage(StagedOp::InsertObjectRef(row.clone()))?;
        Ok(row)
    }

    async fn create_proposal(&mut self, new: NewWorkflowProposal) -> Result<WorkflowProposalRow, DbError> {
        check_failure(&self.failures, FailPoint::CreateProposal)?;
        let row = new.into_row();
        self.stage(StagedOp::InsertProposal(row.clone()))?;
        Ok(row)
    }

    async fn set_instance_proposal(&mut self, instance_id: Uuid, proposal_id: Uuid) -> Result<(), DbError> {
        self.stage(StagedOp::SetInstanceProposal { instance_id, proposal_id })?;
        Ok(())
    }

    async fn proposal_ids_for_instances(&mut self, instance_ids: &[Uuid]) -> Result<Vec<Uuid>, DbError> {
        Ok(self.working.proposal_ids_for_instances(instance_ids))
    }

    async fn delete_assignment_targets(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        self.stage(StagedOp::DeleteAssignmentTargets(instance_ids.to_vec()))
    }

    async fn delete_assignments(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        self.stage(StagedOp::DeleteAssignments(instance_ids.to_vec()))
    }

    async fn delete_proposals(&mut self, proposal_ids: &[Uuid]) -> Result<u64, DbError> {
        self.stage(StagedOp::DeleteProposals(proposal_ids.to_vec()))
    }

    async fn delete_object_refs(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        self.stage(StagedOp::DeleteObjectRefs(instance_ids.to_vec()))
    }

    async fn delete_events(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        self.stage(StagedOp::DeleteEvents(instance_ids.to_vec()))
    }

    async fn delete_instances(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        self.stage(StagedOp::DeleteInstances(instance_ids.to_vec()))
    }

    async fn commit(self) -> Result<(), DbError> {
        check_failure(&self.failures, FailPoint::Commit)?;
        let mut shared = self.shared.lock();
        let mut next = shared.clone();
        for op in &self.ops {
            op.apply(&mut next)?;
        }
        *shared = next;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DbError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ObjectState {
    /// `(type, id)` → (owner, fields)
    objects: HashMap<(String, String), (String, Map<String, Value>)>,
    /// `(owner, group)` → members
    groups: HashMap<(String, String), Vec<String>>,
    /// `(owner, role)` → members
    roles: HashMap<(String, String), Vec<String>>,
}

/// In-memory [`ObjectStore`] holding objects as JSON maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<ObjectState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, object_type: &str, id: &str, owner_id: &str, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state
            .lock()
            .objects
            .insert((object_type.to_string(), id.to_string()), (owner_id.to_string(), fields));
    }

    pub fn add_group_members(&self, owner_id: &str, group_id: &str, members: &[&str]) {
        self.state
            .lock()
            .groups
            .entry((owner_id.to_string(), group_id.to_string()))
            .or_default()
            .extend(members.iter().map(|m| m.to_string()));
    }

    pub fn add_role_members(&self, owner_id: &str, role: &str, members: &[&str]) {
        self.state
            .lock()
            .roles
            .entry((owner_id.to_string(), role.to_string()))
            .or_default()
            .extend(members.iter().map(|m| m.to_string()));
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn load_object(&self, object_type: &str, id: &str) -> Result<Value, DbError> {
        let state = self.state.lock();
        let (_, fields) = state
            .objects
            .get(&(object_type.to_string(), id.to_string()))
            .ok_or(DbError::NotFound)?;
        let mut node = fields.clone();
        node.entry("id".to_string()).or_insert_with(|| Value::String(id.to_string()));
        Ok(Value::Object(node))
    }

    async fn apply_field_updates(&self, object_type: &str, id: &str, updates: &Map<String, Value>) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let (_, fields) = state
            .objects
            .get_mut(&(object_type.to_string(), id.to_string()))
            .ok_or(DbError::NotFound)?;
        for (key, value) in updates {
            fields.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn object_owner_id(&self, object_type: &str, id: &str) -> Result<String, DbError> {
        let state = self.state.lock();
        state
            .objects
            .get(&(object_type.to_string(), id.to_string()))
            .map(|(owner, _)| owner.clone())
            .ok_or(DbError::NotFound)
    }

    async fn group_member_ids(&self, owner_id: &str, group_id: &str) -> Result<Vec<String>, DbError> {
        let state = self.state.lock();
        Ok(state
            .groups
            .get(&(owner_id.to_string(), group_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn role_member_ids(&self, owner_id: &str, role: &str) -> Result<Vec<String>, DbError> {
        let state = self.state.lock();
        Ok(state
            .roles
            .get(&(owner_id.to_string(), role.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
