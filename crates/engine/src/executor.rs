//! Workflow engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. Matches a mutation against the owner's active definitions (triggers,
//!    trigger expressions, conditions).
//! 2. Guards against duplicate and cooling-down instances, then creates the
//!    instance and its object ref in one transaction.
//! 3. Runs the definition's actions in order, pausing on approvals and
//!    reviews until their assignments are decided, and on queued executor
//!    actions until the action worker has run them.
//! 4. Records every step on the audit log and emits it as a lifecycle event.
//!
//! Proposal routing lives in [`crate::proposal`], per-action dispatch in
//! [`crate::dispatch`] and assignment decisions in [`crate::assignment`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use actions::ActionExecutor;
use db::models::*;
use db::store::{DefinitionFilter, InstanceFilter};
use db::{with_tx, DbError, ObjectStore, WorkflowStore, WorkflowTx};
use queue::Runtime;

use crate::cel::{CelEvaluator, ExpressionScope};
use crate::changeset::{build_proposed_changes, normalize_strings, RecordedMutation};
use crate::config::WorkflowConfig;
use crate::dispatch::ActionOutcome;
use crate::domain::DomainChanges;
use crate::emit::{topics, LifecycleEvent, WorkflowEmitter};
use crate::error::{CreationStage, WorkflowCreationError};
use crate::models::{ActionType, Caller, WorkflowDefinitionDocument, WorkflowEventPayload, WorkflowInstanceContext};
use crate::object::{CelVarsInput, Object, WorkflowRegistry};
use crate::observability::{Observer, OP_HANDLE_MUTATION, OP_TRIGGER_WORKFLOW};
use crate::trigger::{derive_trigger_prefilter, matching_triggers};
use crate::EngineError;

/// Maps action types to host-provided executors.
pub type ActionRegistry = HashMap<ActionType, Arc<dyn ActionExecutor>>;

// ---------------------------------------------------------------------------
// Trigger input
// ---------------------------------------------------------------------------

/// The change-set a workflow is triggered with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerInput {
    /// `CREATE`, `UPDATE` or `DELETE`.
    pub event_type: String,
    pub changed_fields: Vec<String>,
    pub changed_edges: Vec<String>,
    pub added_ids: BTreeMap<String, Vec<String>>,
    pub removed_ids: BTreeMap<String, Vec<String>>,
    pub user_id: String,
    pub proposed_changes: Map<String, Value>,
}

impl TriggerInput {
    /// Build from a mutation whose eligible changed fields are already known.
    pub fn from_mutation(mutation: &RecordedMutation, changed_fields: Vec<String>) -> Self {
        let proposed_changes = build_proposed_changes(mutation, &changed_fields);
        Self {
            event_type: mutation.operation.trim().to_ascii_uppercase(),
            changed_fields,
            changed_edges: normalize_strings(&mutation.changed_edges),
            added_ids: mutation.added_ids.clone(),
            removed_ids: mutation.removed_ids.clone(),
            user_id: mutation.user_id.clone(),
            proposed_changes,
        }
    }

    pub fn from_context(context: &WorkflowInstanceContext) -> Self {
        Self {
            event_type: context.trigger_event_type.clone(),
            changed_fields: context.trigger_changed_fields.clone(),
            changed_edges: context.trigger_changed_edges.clone(),
            added_ids: context.trigger_added_ids.clone(),
            removed_ids: context.trigger_removed_ids.clone(),
            user_id: context.trigger_user_id.clone(),
            proposed_changes: context.trigger_proposed_changes.clone(),
        }
    }

    /// Changed fields followed by changed edges.
    pub fn changed(&self) -> Vec<String> {
        self.changed_fields
            .iter()
            .chain(self.changed_edges.iter())
            .cloned()
            .collect()
    }

    pub fn cel_input(&self) -> CelVarsInput<'_> {
        CelVarsInput {
            changed_fields: &self.changed_fields,
            changed_edges: &self.changed_edges,
            added_ids: &self.added_ids,
            removed_ids: &self.removed_ids,
            event_type: &self.event_type,
            user_id: &self.user_id,
        }
    }

    /// Restrict the proposed changes to one approval domain.
    pub fn for_domain(&self, domain: &DomainChanges) -> Self {
        let mut input = self.clone();
        input.changed_fields = domain.changes.keys().cloned().collect();
        input.proposed_changes = domain.changes.clone();
        input
    }

    fn context(&self, definition_id: Uuid, object: &Object) -> WorkflowInstanceContext {
        WorkflowInstanceContext {
            workflow_definition_id: definition_id.to_string(),
            object_type: object.object_type.to_string(),
            object_id: object.id.clone(),
            trigger_event_type: self.event_type.clone(),
            trigger_changed_fields: self.changed_fields.clone(),
            trigger_changed_edges: self.changed_edges.clone(),
            trigger_added_ids: self.added_ids.clone(),
            trigger_removed_ids: self.removed_ids.clone(),
            trigger_user_id: self.user_id.clone(),
            trigger_proposed_changes: self.proposed_changes.clone(),
            data: Map::new(),
        }
    }
}

/// Proposal row to create alongside a new instance.
#[derive(Debug, Clone)]
pub(crate) struct PendingProposal {
    pub domain: DomainChanges,
    pub hash: String,
    pub state: ProposalState,
    pub submitted_by: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates workflow instances over a [`WorkflowStore`].
///
/// Build one per process and share it; every method takes `&self`.
pub struct WorkflowEngine<S: WorkflowStore> {
    pub(crate) store: Arc<S>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) registry: Arc<WorkflowRegistry>,
    pub(crate) executors: ActionRegistry,
    pub(crate) cel: CelEvaluator,
    pub(crate) emitter: WorkflowEmitter,
    pub(crate) config: WorkflowConfig,
    pub(crate) observer: Observer,
}

impl<S: WorkflowStore> WorkflowEngine<S> {
    /// Create an engine with no runtime and no action executors.
    pub fn new(
        store: Arc<S>,
        objects: Arc<dyn ObjectStore>,
        registry: Arc<WorkflowRegistry>,
        config: WorkflowConfig,
    ) -> Self {
        let observer = Observer::default();
        Self {
            store,
            objects,
            registry,
            executors: ActionRegistry::new(),
            cel: CelEvaluator::new(config.cel.clone()),
            emitter: WorkflowEmitter::new(None, observer),
            config,
            observer,
        }
    }

    pub fn builder() -> WorkflowEngineBuilder<S> {
        WorkflowEngineBuilder::default()
    }

    /// Emit lifecycle events through `runtime`.
    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.emitter = WorkflowEmitter::new(Some(runtime), self.observer);
        self
    }

    /// Run actions of `action_type` through `executor`.
    pub fn with_executor(mut self, action_type: ActionType, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executors.insert(action_type, executor);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &CelEvaluator {
        &self.cel
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    /// The trigger input for `mutation`, with fields filtered through the
    /// registry's eligibility sets.
    pub fn trigger_input(&self, mutation: &RecordedMutation) -> TriggerInput {
        let changed = self.registry.changed_fields(mutation, self.config.eligibility);
        TriggerInput::from_mutation(mutation, changed)
    }

    /// Start every matching workflow for a committed mutation.
    ///
    /// Pre-commit approval definitions are skipped for updates; those are
    /// routed to proposals by [`WorkflowEngine::route_mutation`] before the
    /// change applies. Objects with an active (or cooling-down) instance of a
    /// definition are skipped for that definition.
    #[instrument(skip(self, caller, mutation), fields(object_type = %mutation.object_type, object_id = %mutation.object_id))]
    pub async fn handle_mutation(
        &self,
        caller: &Caller,
        mutation: &RecordedMutation,
    ) -> Result<Vec<WorkflowInstanceRow>, EngineError> {
        let scope = self
            .observer
            .scope(OP_HANDLE_MUTATION, &mutation.operation)
            .field("object_type", &mutation.object_type)
            .field("object_id", &mutation.object_id);

        if !self.config.is_enabled() {
            scope.skip("workflows disabled");
            return Ok(Vec::new());
        }
        let owner_id = match caller.require_organization() {
            Ok(owner) => owner.to_string(),
            Err(e) => return Err(scope.fail(e)),
        };
        if mutation.object_id.trim().is_empty() {
            return Err(scope.fail(EngineError::MissingObjectId));
        }

        let input = self.trigger_input(mutation);
        if input.event_type == "UPDATE" && input.changed().is_empty() {
            scope.skip("no eligible changes");
            return Ok(Vec::new());
        }

        match self.start_matching(&owner_id, mutation, &input).await {
            Ok(started) => {
                scope.field("instances", started.len()).end();
                Ok(started)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    async fn start_matching(
        &self,
        owner_id: &str,
        mutation: &RecordedMutation,
        input: &TriggerInput,
    ) -> Result<Vec<WorkflowInstanceRow>, EngineError> {
        let object = self.load_object(&mutation.object_type, &mutation.object_id).await?;
        let mut started = Vec::new();

        for (row, doc) in self.candidate_definitions(owner_id, &object, input).await? {
            if input.event_type == "UPDATE" && doc.gates_before_commit() {
                debug!(definition_id = %row.id, "pre-commit approval definition; routed separately");
                continue;
            }
            match self.start_workflow(owner_id, &row, &doc, &object, input).await {
                Ok(instance) => started.push(instance),
                Err(EngineError::WorkflowAlreadyActive(existing)) => {
                    debug!(definition_id = %row.id, instance_id = %existing, "workflow already active; not triggering");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    /// Start definition `definition_id` for `object` regardless of its
    /// triggers. The active-instance guard and cooldown still apply.
    pub async fn trigger_workflow(
        &self,
        caller: &Caller,
        definition_id: Uuid,
        object: &Object,
        input: &TriggerInput,
    ) -> Result<WorkflowInstanceRow, EngineError> {
        let scope = self
            .observer
            .scope(OP_TRIGGER_WORKFLOW, &input.event_type)
            .field("definition_id", definition_id)
            .field("object_id", &object.id);

        let result: Result<WorkflowInstanceRow, EngineError> = async {
            let owner_id = caller.require_organization()?;
            if object.id.trim().is_empty() {
                return Err(EngineError::MissingObjectId);
            }
            let row = self.store.get_definition(definition_id).await?;
            if row.owner_id != owner_id || row.deleted_at.is_some() || !row.active {
                return Err(DbError::NotFound.into());
            }
            let doc = WorkflowDefinitionDocument::from_value(&row.definition)?;
            let object = match &object.node {
                Some(_) => object.clone(),
                None => self.load_object(object.object_type.as_str(), &object.id).await?,
            };
            self.start_workflow(owner_id, &row, &doc, &object, input).await
        }
        .await;

        match result {
            Ok(instance) => {
                scope.field("instance_id", instance.id).end();
                Ok(instance)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    /// Active definitions of the object's type whose triggers, trigger
    /// expressions and conditions all pass.
    pub(crate) async fn candidate_definitions(
        &self,
        owner_id: &str,
        object: &Object,
        input: &TriggerInput,
    ) -> Result<Vec<(WorkflowDefinitionRow, WorkflowDefinitionDocument)>, EngineError> {
        let filter = DefinitionFilter {
            owner_id: owner_id.to_string(),
            schema_type: object.object_type.to_string(),
            operation: Some(input.event_type.clone()),
        };
        let rows = self.store.list_definitions(&filter).await?;
        let changed = input.changed();
        let vars = self.registry.build_cel_vars(object, &input.cel_input());

        let mut matched = Vec::new();
        for row in rows {
            let doc = WorkflowDefinitionDocument::from_value(&row.definition)?;
            if let Some(fields) = derive_trigger_prefilter(&doc).fields {
                if !fields.iter().any(|f| changed.contains(f)) {
                    continue;
                }
            }
            if !self.triggers_pass(&doc, &input.event_type, &changed, &vars).await? {
                continue;
            }
            if !self.conditions_pass(&doc, &vars).await? {
                debug!(definition_id = %row.id, "definition conditions not met");
                continue;
            }
            matched.push((row, doc));
        }
        Ok(matched)
    }

    async fn triggers_pass(
        &self,
        doc: &WorkflowDefinitionDocument,
        event_type: &str,
        changed: &[String],
        vars: &Map<String, Value>,
    ) -> Result<bool, EngineError> {
        for trigger in matching_triggers(doc, event_type, changed) {
            if trigger.expression.trim().is_empty() {
                return Ok(true);
            }
            if self.cel.evaluate(&trigger.expression, ExpressionScope::Base, vars).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn conditions_pass(&self, doc: &WorkflowDefinitionDocument, vars: &Map<String, Value>) -> Result<bool, EngineError> {
        for condition in &doc.conditions {
            if !self.cel.evaluate(&condition.expression, ExpressionScope::Base, vars).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn start_workflow(
        &self,
        owner_id: &str,
        row: &WorkflowDefinitionRow,
        doc: &WorkflowDefinitionDocument,
        object: &Object,
        input: &TriggerInput,
    ) -> Result<WorkflowInstanceRow, EngineError> {
        self.ensure_can_trigger(owner_id, row, object, None).await?;
        let (instance, _) = self
            .create_workflow_rows(owner_id, row, doc, object, input, InstanceState::Running, None)
            .await?;
        self.record_triggered(&instance, input).await?;
        self.run_instance(instance).await
    }

    /// At most one running or paused instance per (definition, object), or
    /// per (object, domain) when `domain_key` is given; plus the cooldown.
    pub(crate) async fn ensure_can_trigger(
        &self,
        owner_id: &str,
        row: &WorkflowDefinitionRow,
        object: &Object,
        domain_key: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut filter = InstanceFilter {
            owner_id: owner_id.to_string(),
            object_type: object.object_type.to_string(),
            object_id: object.id.clone(),
            workflow_definition_id: Some(row.id),
            domain_key: None,
            states: vec![InstanceState::Running, InstanceState::Paused],
            created_after: None,
        };
        if let Some(key) = domain_key {
            filter.workflow_definition_id = None;
            filter.domain_key = Some(key.to_string());
        }
        if let Some(active) = self.store.find_instances(&filter).await?.first() {
            return Err(EngineError::WorkflowAlreadyActive(active.id));
        }

        if let Some(window_start) = cooldown_window_start(row.cooldown_seconds) {
            filter.workflow_definition_id = Some(row.id);
            filter.domain_key = None;
            filter.states.clear();
            filter.created_after = Some(window_start);
            if let Some(recent) = self.store.find_instances(&filter).await?.first() {
                return Err(EngineError::WorkflowAlreadyActive(recent.id));
            }
        }
        Ok(())
    }

    /// Create the instance, its object ref and optionally a linked proposal
    /// in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create_workflow_rows(
        &self,
        owner_id: &str,
        row: &WorkflowDefinitionRow,
        doc: &WorkflowDefinitionDocument,
        object: &Object,
        input: &TriggerInput,
        state: InstanceState,
        proposal: Option<PendingProposal>,
    ) -> Result<(WorkflowInstanceRow, Option<WorkflowProposalRow>), EngineError> {
        let ref_filter = self.registry.object_ref_filter(object)?;
        let context = serde_json::to_value(input.context(row.id, object))?;
        let snapshot = serde_json::to_value(doc.execution_snapshot())?;

        let new_instance = NewWorkflowInstance {
            workflow_definition_id: row.id,
            owner_id: owner_id.to_string(),
            state,
            object_type: object.object_type.to_string(),
            object_id: object.id.clone(),
            domain_key: proposal.as_ref().map(|p| p.domain.domain_key.clone()),
            context,
            definition_snapshot: snapshot,
        };
        let owner = owner_id.to_string();

        with_tx::<_, _, EngineError, _>(&*self.store, move |tx| {
            Box::pin(async move {
                let mut instance = tx
                    .create_instance(new_instance)
                    .await
                    .map_err(|source| WorkflowCreationError { stage: CreationStage::Instance, source })?;
                let object_ref = tx
                    .create_object_ref(NewWorkflowObjectRef {
                        workflow_instance_id: instance.id,
                        owner_id: owner.clone(),
                        column: ref_filter.column,
                        object_id: ref_filter.object_id,
                    })
                    .await
                    .map_err(|source| WorkflowCreationError { stage: CreationStage::ObjectRef, source })?;

                let Some(pending) = proposal else {
                    return Ok((instance, None));
                };
                let created = tx
                    .create_proposal(NewWorkflowProposal {
                        workflow_object_ref_id: object_ref.id,
                        owner_id: owner,
                        object_type: instance.object_type.clone(),
                        object_id: instance.object_id.clone(),
                        domain_key: pending.domain.domain_key,
                        state: pending.state,
                        changes: Value::Object(pending.domain.changes),
                        proposed_hash: pending.hash,
                        submitted_by: pending.submitted_by,
                    })
                    .await
                    .map_err(|source| WorkflowCreationError { stage: CreationStage::Proposal, source })?;
                tx.set_instance_proposal(instance.id, created.id)
                    .await
                    .map_err(|source| WorkflowCreationError { stage: CreationStage::Proposal, source })?;
                instance.workflow_proposal_id = Some(created.id);
                Ok((instance, Some(created)))
            })
        })
        .await
    }

    pub(crate) async fn record_triggered(&self, instance: &WorkflowInstanceRow, input: &TriggerInput) -> Result<(), EngineError> {
        let details = json!({
            "definitionId": instance.workflow_definition_id,
            "eventType": input.event_type,
            "changedFields": input.changed_fields,
            "changedEdges": input.changed_edges,
            "domainKey": instance.domain_key,
        });
        self.record_event(instance, EventType::WorkflowTriggered, "", details).await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::WorkflowTriggered, topics::WORKFLOW_TRIGGERED, instance)
                .with("eventType", json!(input.event_type))
                .with("changedFields", json!(input.changed_fields)),
        )
        .await;
        info!(instance_id = %instance.id, definition_id = %instance.workflow_definition_id, "workflow triggered");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run actions from the instance's current index until it pauses, fails
    /// or completes. Returns the instance as it was left.
    pub(crate) async fn run_instance(&self, mut instance: WorkflowInstanceRow) -> Result<WorkflowInstanceRow, EngineError> {
        if instance.state != InstanceState::Running {
            return Ok(instance);
        }
        let doc = WorkflowDefinitionDocument::from_value(&instance.definition_snapshot)?;
        let mut context = WorkflowInstanceContext::from_value(&instance.context);
        let object = self.load_object(&instance.object_type, &instance.object_id).await?;
        let start = instance.current_action_index.max(0) as usize;

        for (index, action) in doc.actions.iter().enumerate().skip(start) {
            match self.execute_action(&instance, &doc, &context, &object, index, action).await {
                Ok(ActionOutcome::Completed(output)) => {
                    context.data.insert(action.key.clone(), output);
                    self.save_progress(&mut instance, index + 1, &context).await?;
                }
                Ok(ActionOutcome::Skipped(_)) => {
                    self.save_progress(&mut instance, index + 1, &context).await?;
                }
                Ok(ActionOutcome::Paused) => {
                    self.save_progress(&mut instance, index, &context).await?;
                    self.pause(&mut instance, &format!("awaiting decisions on '{}'", action.key)).await?;
                    return Ok(instance);
                }
                Ok(ActionOutcome::Queued) => {
                    self.save_progress(&mut instance, index, &context).await?;
                    self.pause(&mut instance, &format!("awaiting execution of '{}'", action.key)).await?;
                    return Ok(instance);
                }
                Err(e) => {
                    if let Err(fail_err) = self.fail(&mut instance, &e.to_string()).await {
                        let id = instance.id.to_string();
                        self.observer
                            .warn_engine(OP_TRIGGER_WORKFLOW, &action.kind, &[("instance_id", id.as_str())], Some(&fail_err));
                    }
                    return Err(e);
                }
            }
        }

        self.apply_linked_proposal(&instance).await?;
        self.complete(&mut instance).await?;
        Ok(instance)
    }

    pub(crate) async fn save_progress(
        &self,
        instance: &mut WorkflowInstanceRow,
        index: usize,
        context: &WorkflowInstanceContext,
    ) -> Result<(), EngineError> {
        let value = serde_json::to_value(context)?;
        self.store
            .update_instance_progress(instance.id, index as i32, value.clone())
            .await?;
        instance.current_action_index = index as i32;
        instance.context = value;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instance state
    // -----------------------------------------------------------------------

    async fn transition(&self, instance: &mut WorkflowInstanceRow, next: InstanceState) -> Result<(), EngineError> {
        if !instance.state.can_transition_to(next) {
            return Err(EngineError::InvalidInstanceTransition { from: instance.state, to: next });
        }
        self.store.update_instance_state(instance.id, next).await?;
        instance.state = next;
        Ok(())
    }

    pub(crate) async fn pause(&self, instance: &mut WorkflowInstanceRow, reason: &str) -> Result<(), EngineError> {
        self.transition(instance, InstanceState::Paused).await?;
        self.record_event(instance, EventType::InstancePaused, "", json!({ "reason": reason })).await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::InstancePaused, topics::INSTANCE_PAUSED, instance).with("reason", json!(reason)),
        )
        .await;
        Ok(())
    }

    pub(crate) async fn resume(&self, instance: &mut WorkflowInstanceRow) -> Result<(), EngineError> {
        self.transition(instance, InstanceState::Running).await?;
        self.record_event(instance, EventType::InstanceResumed, "", json!({})).await?;
        self.publish(instance, LifecycleEvent::new(EventType::InstanceResumed, topics::INSTANCE_RESUMED, instance))
            .await;
        Ok(())
    }

    async fn complete(&self, instance: &mut WorkflowInstanceRow) -> Result<(), EngineError> {
        self.transition(instance, InstanceState::Completed).await?;
        self.record_event(instance, EventType::InstanceCompleted, "", json!({ "state": InstanceState::Completed }))
            .await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::InstanceCompleted, topics::INSTANCE_COMPLETED, instance)
                .with("state", json!(InstanceState::Completed)),
        )
        .await;
        info!(instance_id = %instance.id, "workflow instance completed");
        Ok(())
    }

    /// Fail a non-terminal instance and reject its submitted proposal.
    pub(crate) async fn fail(&self, instance: &mut WorkflowInstanceRow, reason: &str) -> Result<(), EngineError> {
        if !fail_instance_rows(&*self.store, instance).await? {
            return Ok(());
        }

        let details = json!({ "state": InstanceState::Failed, "reason": reason });
        self.record_event(instance, EventType::InstanceCompleted, "", details).await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::InstanceCompleted, topics::INSTANCE_COMPLETED, instance)
                .with("state", json!(InstanceState::Failed))
                .with("reason", json!(reason)),
        )
        .await;
        info!(instance_id = %instance.id, reason, "workflow instance failed");
        Ok(())
    }

    /// Pause a running instance by hand.
    pub async fn pause_instance(&self, caller: &Caller, instance_id: Uuid) -> Result<WorkflowInstanceRow, EngineError> {
        let mut instance = self.load_instance(caller, instance_id).await?;
        self.pause(&mut instance, "paused by caller").await?;
        Ok(instance)
    }

    /// Resume a paused instance and run it from its current action.
    pub async fn resume_instance(&self, caller: &Caller, instance_id: Uuid) -> Result<WorkflowInstanceRow, EngineError> {
        let mut instance = self.load_instance(caller, instance_id).await?;
        self.resume(&mut instance).await?;
        self.run_instance(instance).await
    }

    /// An instance of the caller's organization.
    pub async fn load_instance(&self, caller: &Caller, instance_id: Uuid) -> Result<WorkflowInstanceRow, EngineError> {
        let owner_id = caller.require_organization()?;
        let instance = self.store.get_instance(instance_id).await?;
        if instance.owner_id != owner_id {
            return Err(DbError::NotFound.into());
        }
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// `object_type`/`object_id` with its current fields, or without a node
    /// when the object no longer exists (e.g. after a delete).
    pub(crate) async fn load_object(&self, object_type: &str, object_id: &str) -> Result<Object, EngineError> {
        match self.objects.load_object(object_type, object_id).await {
            Ok(node) => Ok(Object::new(object_type, object_id).with_node(Arc::new(node))),
            Err(DbError::NotFound) => Ok(Object::new(object_type, object_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Append an audit event for `instance`.
    pub(crate) async fn record_event(
        &self,
        instance: &WorkflowInstanceRow,
        event_type: EventType,
        action_key: &str,
        details: Value,
    ) -> Result<(), EngineError> {
        let payload = WorkflowEventPayload {
            event_type,
            action_key: action_key.to_string(),
            details,
        };
        self.store
            .create_event(NewWorkflowEvent {
                workflow_instance_id: instance.id,
                owner_id: instance.owner_id.clone(),
                event_type,
                payload: serde_json::to_value(payload)?,
            })
            .await?;
        Ok(())
    }

    /// Emit a lifecycle event; failures are recorded for the reconciler.
    pub(crate) async fn publish(&self, instance: &WorkflowInstanceRow, event: LifecycleEvent) {
        let receipt = self.emitter.publish(&*self.store, instance, event).await;
        if !receipt.is_ok() {
            debug!(instance_id = %instance.id, event_id = %receipt.event_id, "lifecycle event queued for reconciliation");
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`WorkflowEngine`]; `build` fails without both stores.
pub struct WorkflowEngineBuilder<S: WorkflowStore> {
    store: Option<Arc<S>>,
    objects: Option<Arc<dyn ObjectStore>>,
    registry: Option<Arc<WorkflowRegistry>>,
    runtime: Option<Arc<dyn Runtime>>,
    executors: ActionRegistry,
    config: WorkflowConfig,
}

impl<S: WorkflowStore> Default for WorkflowEngineBuilder<S> {
    fn default() -> Self {
        Self {
            store: None,
            objects: None,
            registry: None,
            runtime: None,
            executors: ActionRegistry::new(),
            config: WorkflowConfig::default(),
        }
    }
}

impl<S: WorkflowStore> WorkflowEngineBuilder<S> {
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn registry(mut self, registry: Arc<WorkflowRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn executor(mut self, action_type: ActionType, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executors.insert(action_type, executor);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<WorkflowEngine<S>, EngineError> {
        let store = self.store.ok_or(EngineError::NoStoreConfigured)?;
        let objects = self.objects.ok_or(EngineError::NoStoreConfigured)?;
        let registry = self.registry.unwrap_or_else(|| Arc::new(WorkflowRegistry::new()));

        let mut engine = WorkflowEngine::new(store, objects, registry, self.config);
        engine.executors = self.executors;
        if let Some(runtime) = self.runtime {
            engine = engine.with_runtime(runtime);
        }
        Ok(engine)
    }
}

/// Start of the cooldown window ending now. `None` for no cooldown, and for
/// a cooldown too long to represent.
pub(crate) fn cooldown_window_start(cooldown_seconds: i64) -> Option<DateTime<Utc>> {
    if cooldown_seconds <= 0 {
        return None;
    }
    chrono::Duration::try_seconds(cooldown_seconds).and_then(|window| Utc::now().checked_sub_signed(window))
}

/// Move a live instance to `FAILED` and reject its linked proposal if that
/// is still open, so the proposal's domain slot is released.
///
/// Returns `false` when the instance was already terminal.
pub(crate) async fn fail_instance_rows<S: WorkflowStore + ?Sized>(
    store: &S,
    instance: &mut WorkflowInstanceRow,
) -> Result<bool, EngineError> {
    if instance.state.is_terminal() {
        return Ok(false);
    }
    if !instance.state.can_transition_to(InstanceState::Failed) {
        return Err(EngineError::InvalidInstanceTransition {
            from: instance.state,
            to: InstanceState::Failed,
        });
    }
    store.update_instance_state(instance.id, InstanceState::Failed).await?;
    instance.state = InstanceState::Failed;

    if let Some(proposal_id) = instance.workflow_proposal_id {
        let mut proposal = store.get_proposal(proposal_id).await?;
        if ProposalState::OPEN.contains(&proposal.state) {
            proposal.state = ProposalState::Rejected;
            store.update_proposal(&proposal).await?;
            debug!(instance_id = %instance.id, proposal_id = %proposal.id, "open proposal rejected with its instance");
        }
    }
    Ok(true)
}
