//! Per-action dispatch.
//!
//! Approvals and reviews create one assignment per resolved user and pause
//! the instance. `NOTIFY` resolves recipients for its executor, `UPDATE_FIELD`
//! writes through the object store, and every other type is handed to the
//! registered [`ActionExecutor`] with exponential back-off on retryable
//! failures. With queued dispatch the executor call becomes an
//! [`ActionJob`] on the runtime and the instance pauses until a worker runs
//! it through [`WorkflowEngine::run_queued_action`].

use std::collections::{BTreeMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use actions::{ActionError, ActionExecutor, ActionRequest};
use db::models::*;
use db::{DbError, WorkflowStore};

use crate::cel::ExpressionScope;
use crate::config::ActionDispatch;
use crate::changeset::normalize_strings;
use crate::domain::{approval_domains, derive_domain_key};
use crate::emit::{topics, LifecycleEvent};
use crate::executor::{TriggerInput, WorkflowEngine};
use crate::models::{
    ActionType, ApprovalActionParams, AssignmentApprovalMetadata, FieldUpdateActionParams, NotifyActionParams,
    TargetConfig, WorkflowAction, WorkflowDefinitionDocument, WorkflowInstanceContext,
};
use crate::object::Object;
use crate::observability::OP_EXECUTE_ACTION;
use crate::targets::resolve_targets;
use crate::worker::ActionJob;
use crate::EngineError;

lazy_static! {
    static ref TEMPLATE: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap();
}

/// What running one action did to its instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Finished with this output; continue with the next action.
    Completed(Value),
    /// Waiting on assignments.
    Paused,
    /// Not run, for this reason.
    Skipped(String),
    /// Handed to the action worker.
    Queued,
}

impl<S: WorkflowStore> WorkflowEngine<S> {
    /// Run one action, recording its lifecycle events.
    pub(crate) async fn execute_action(
        &self,
        instance: &WorkflowInstanceRow,
        doc: &WorkflowDefinitionDocument,
        context: &WorkflowInstanceContext,
        object: &Object,
        index: usize,
        action: &WorkflowAction,
    ) -> Result<ActionOutcome, EngineError> {
        let scope = self
            .observer
            .scope(OP_EXECUTE_ACTION, &action.kind)
            .field("instance_id", instance.id)
            .field("action_key", &action.key);

        match self.guarded_dispatch(instance, doc, context, object, index, action).await {
            Ok(ActionOutcome::Completed(output)) => {
                if let Err(e) = self.record_completed(instance, index, action, &output).await {
                    return Err(scope.fail(e));
                }
                scope.end();
                Ok(ActionOutcome::Completed(output))
            }
            Ok(ActionOutcome::Skipped(reason)) => {
                if let Err(e) = self.record_skipped(instance, index, action, &reason).await {
                    return Err(scope.fail(e));
                }
                scope.skip(&reason);
                Ok(ActionOutcome::Skipped(reason))
            }
            Ok(ActionOutcome::Paused) => {
                scope.field("paused", true).end();
                Ok(ActionOutcome::Paused)
            }
            Ok(ActionOutcome::Queued) => {
                scope.field("queued", true).end();
                Ok(ActionOutcome::Queued)
            }
            Err(e) => {
                self.record_failed(instance, index, action, &e).await;
                Err(scope.fail(e))
            }
        }
    }

    async fn guarded_dispatch(
        &self,
        instance: &WorkflowInstanceRow,
        doc: &WorkflowDefinitionDocument,
        context: &WorkflowInstanceContext,
        object: &Object,
        index: usize,
        action: &WorkflowAction,
    ) -> Result<ActionOutcome, EngineError> {
        if !action.when.trim().is_empty() {
            let vars = self.action_vars(instance, context, object).await?;
            if !self.cel.evaluate(&action.when, ExpressionScope::Action, &vars).await? {
                return Ok(ActionOutcome::Skipped("when guard evaluated to false".into()));
            }
        }
        let Some(action_type) = action.action_type() else {
            return Err(EngineError::DefinitionInvalid(vec![format!(
                "action '{}' has unknown type '{}'",
                action.key, action.kind
            )]));
        };

        self.record_event(instance, EventType::ActionStarted, &action.key, json!({ "actionIndex": index, "actionType": action_type }))
            .await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::ActionStarted, topics::ACTION_STARTED, instance)
                .action(&action.key, index)
                .with("actionType", json!(action_type)),
        )
        .await;

        match action_type {
            ActionType::RequestApproval | ActionType::RequestReview => {
                self.request_decisions(instance, doc, object, index, action, action_type).await
            }
            ActionType::Notify => self.notify(instance, object, index, action).await,
            ActionType::UpdateField => self.update_fields(instance, object, action).await,
            other => {
                let params = apply_templates(&action.params, &replacements(instance, object));
                self.run_executor(instance, index, action, other, params, Vec::new()).await
            }
        }
    }

    /// Base variables plus `assignments`, `instance` and `initiator`.
    pub(crate) async fn action_vars(
        &self,
        instance: &WorkflowInstanceRow,
        context: &WorkflowInstanceContext,
        object: &Object,
    ) -> Result<Map<String, Value>, EngineError> {
        let input = TriggerInput::from_context(context);
        let mut vars = self.registry.build_cel_vars(object, &input.cel_input());

        let assignments: Vec<Value> = self
            .store
            .list_assignments(instance.id)
            .await?
            .iter()
            .map(|a| {
                json!({
                    "key": a.assignment_key,
                    "action_key": a.action_key,
                    "status": a.status,
                    "required": a.required,
                    "decided_by": a.decided_by,
                })
            })
            .collect();
        vars.insert("assignments".into(), Value::Array(assignments));
        vars.insert(
            "instance".into(),
            json!({
                "id": instance.id.to_string(),
                "state": instance.state,
                "current_action_index": instance.current_action_index,
                "domain_key": instance.domain_key,
                "data": context.data,
            }),
        );
        vars.insert("initiator".into(), json!(context.trigger_user_id));
        Ok(vars)
    }

    // -----------------------------------------------------------------------
    // Approvals and reviews
    // -----------------------------------------------------------------------

    async fn request_decisions(
        &self,
        instance: &WorkflowInstanceRow,
        doc: &WorkflowDefinitionDocument,
        object: &Object,
        index: usize,
        action: &WorkflowAction,
        action_type: ActionType,
    ) -> Result<ActionOutcome, EngineError> {
        let approval = action_type == ActionType::RequestApproval;
        let params: ApprovalActionParams = if approval {
            action.parse_params().map_err(|e| match e {
                EngineError::InvalidActionParams { action_key, source } => {
                    EngineError::ApprovalParamsInvalid { action_key, source }
                }
                other => other,
            })?
        } else {
            action.parse_params()?
        };

        if approval {
            if let Some(reason) = self.outside_domain(instance, doc, &params)? {
                return Ok(ActionOutcome::Skipped(reason));
            }
        }

        let recipients = self.resolve_recipients(instance, object, &params.targets).await?;
        if recipients.is_empty() {
            return Err(if approval {
                EngineError::ApprovalNoTargets(action.key.clone())
            } else {
                EngineError::ReviewNoTargets(action.key.clone())
            });
        }

        let proposed_hash = match (approval, instance.workflow_proposal_id) {
            (true, Some(id)) => self.store.get_proposal(id).await?.proposed_hash,
            _ => String::new(),
        };
        let metadata = AssignmentApprovalMetadata {
            action_key: action.key.clone(),
            action_index: index,
            required: params.is_required(),
            required_count: params.quorum(),
            label: params.label.clone(),
            proposed_hash,
        };
        let prefix = if approval { "approval" } else { "review" };
        let label = (!params.label.trim().is_empty()).then(|| params.label.clone());

        for (user_id, target) in recipients {
            let assignment_key = format!("{prefix}_{}_{user_id}", action.key);
            let created = self
                .store
                .create_assignment(NewWorkflowAssignment {
                    workflow_instance_id: instance.id,
                    owner_id: instance.owner_id.clone(),
                    assignment_key: assignment_key.clone(),
                    action_key: action.key.clone(),
                    required: params.is_required(),
                    label: label.clone(),
                    metadata: serde_json::to_value(&metadata)?,
                })
                .await;
            let assignment = match created {
                Ok(row) => row,
                Err(DbError::Conflict(_)) => {
                    debug!(instance_id = %instance.id, assignment_key, "assignment already exists");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.store
                .create_assignment_target(NewWorkflowAssignmentTarget {
                    workflow_assignment_id: assignment.id,
                    owner_id: instance.owner_id.clone(),
                    target_type: target.target_type.to_string(),
                    target_user_id: user_id.clone(),
                    resolver_key: (!target.resolver_key.is_empty()).then(|| target.resolver_key.clone()),
                })
                .await?;

            let details = json!({
                "assignmentId": assignment.id,
                "assignmentKey": assignment.assignment_key,
                "userId": user_id,
            });
            self.record_event(instance, EventType::AssignmentCreated, &action.key, details).await?;
            self.publish(
                instance,
                LifecycleEvent::new(EventType::AssignmentCreated, topics::ASSIGNMENT_CREATED, instance)
                    .action(&action.key, index)
                    .with("assignmentId", json!(assignment.id))
                    .with("userId", json!(user_id)),
            )
            .await;
        }

        Ok(ActionOutcome::Paused)
    }

    /// For a domain-scoped instance, the reason to skip an approval that
    /// gates a different domain. Instances on the fallback domain run every
    /// approval.
    fn outside_domain(
        &self,
        instance: &WorkflowInstanceRow,
        doc: &WorkflowDefinitionDocument,
        params: &ApprovalActionParams,
    ) -> Result<Option<String>, EngineError> {
        let Some(instance_domain) = instance.domain_key.as_deref() else {
            return Ok(None);
        };
        let fields = normalize_strings(&params.fields);
        if fields.is_empty() {
            return Ok(None);
        }
        if derive_domain_key(&instance.object_type, &fields) == instance_domain {
            return Ok(None);
        }
        let fallback = !approval_domains(doc)?
            .iter()
            .any(|d| derive_domain_key(&instance.object_type, d) == instance_domain);
        Ok((!fallback).then(|| format!("approval gates another domain than '{instance_domain}'")))
    }

    /// Distinct users across `targets`, each with the target that produced it.
    async fn resolve_recipients<'t>(
        &self,
        instance: &WorkflowInstanceRow,
        object: &Object,
        targets: &'t [TargetConfig],
    ) -> Result<Vec<(String, &'t TargetConfig)>, EngineError> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();
        for target in targets {
            let users = resolve_targets(self.registry.targets(), &*self.objects, &instance.owner_id, target, object).await?;
            for user in users {
                if seen.insert(user.clone()) {
                    recipients.push((user, target));
                }
            }
        }
        Ok(recipients)
    }

    // -----------------------------------------------------------------------
    // Side-effecting actions
    // -----------------------------------------------------------------------

    async fn notify(
        &self,
        instance: &WorkflowInstanceRow,
        object: &Object,
        index: usize,
        action: &WorkflowAction,
    ) -> Result<ActionOutcome, EngineError> {
        let params: NotifyActionParams = action.parse_params()?;
        let recipients = self.resolve_recipients(instance, object, &params.targets).await?;
        let recipients = normalize_strings(recipients.iter().map(|(user, _)| user.as_str()));
        let params = apply_templates(&action.params, &replacements(instance, object));
        self.run_executor(instance, index, action, ActionType::Notify, params, recipients).await
    }

    async fn update_fields(
        &self,
        instance: &WorkflowInstanceRow,
        object: &Object,
        action: &WorkflowAction,
    ) -> Result<ActionOutcome, EngineError> {
        let params: FieldUpdateActionParams = action.parse_params()?;
        if params.updates.is_empty() {
            return Ok(ActionOutcome::Skipped("no field updates".into()));
        }
        let replacements = replacements(instance, object);
        let updates: Map<String, Value> = params
            .updates
            .iter()
            .map(|(field, value)| (field.clone(), apply_templates(value, &replacements)))
            .collect();

        self.check_eligible(&instance.object_type, updates.keys())?;
        match self
            .objects
            .apply_field_updates(&instance.object_type, &instance.object_id, &updates)
            .await
        {
            Ok(()) => {}
            Err(DbError::NotFound) => {
                return Err(EngineError::ObjectNotFound {
                    object_type: instance.object_type.clone(),
                    object_id: instance.object_id.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        let fields: Vec<&String> = updates.keys().collect();
        Ok(ActionOutcome::Completed(json!({ "updated": fields })))
    }

    /// Reject the first field outside the type's eligibility set, if it has one.
    pub(crate) fn check_eligible<'a>(
        &self,
        object_type: &str,
        fields: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), EngineError> {
        let Some(eligible) = self.registry.eligible_fields(object_type) else {
            return Ok(());
        };
        match fields.into_iter().find(|f| !eligible.contains(*f)) {
            Some(field) => Err(EngineError::FieldNotEligible {
                field: field.clone(),
                object_type: object_type.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn run_executor(
        &self,
        instance: &WorkflowInstanceRow,
        index: usize,
        action: &WorkflowAction,
        action_type: ActionType,
        params: Value,
        recipients: Vec<String>,
    ) -> Result<ActionOutcome, EngineError> {
        let Some(executor) = self.executors.get(&action_type) else {
            return Ok(ActionOutcome::Skipped(format!("no executor registered for {action_type}")));
        };
        let request = ActionRequest {
            instance_id: instance.id,
            owner_id: instance.owner_id.clone(),
            action_key: action.key.clone(),
            action_type: action_type.to_string(),
            action_index: index,
            object_type: instance.object_type.clone(),
            object_id: instance.object_id.clone(),
            params,
            recipients,
            replacements: BTreeMap::new(),
        };
        if self.queues_actions() {
            self.enqueue_action(instance, index, action, &request).await?;
            return Ok(ActionOutcome::Queued);
        }
        let output = self.execute_with_retry(&action.key, executor.as_ref(), &request).await?;
        Ok(ActionOutcome::Completed(output))
    }

    fn queues_actions(&self) -> bool {
        self.config.executor.dispatch == ActionDispatch::Queued && self.emitter.runtime().is_some()
    }

    /// Put `request` on the job topic. A rejected emit is recorded for the
    /// reconciler like any lifecycle event, so the job is not lost.
    async fn enqueue_action(
        &self,
        instance: &WorkflowInstanceRow,
        index: usize,
        action: &WorkflowAction,
        request: &ActionRequest,
    ) -> Result<(), EngineError> {
        let job = LifecycleEvent::new(EventType::ActionStarted, topics::ACTION_EXECUTE, instance)
            .action(&action.key, index)
            .with("request", serde_json::to_value(request)?);
        let receipt = self.emitter.publish(&*self.store, instance, job).await;
        debug!(
            instance_id = %instance.id,
            action_key = %action.key,
            event_id = %receipt.event_id,
            enqueued = receipt.is_ok(),
            "action job queued"
        );
        Ok(())
    }

    /// Run a job taken off the action queue, then continue the instance.
    ///
    /// The instance must still be paused on the job's action; otherwise the
    /// job is stale and `Ok(None)` is returned without running anything.
    pub async fn run_queued_action(&self, job: &ActionJob) -> Result<Option<WorkflowInstanceRow>, EngineError> {
        let mut instance = self.store.get_instance(job.instance_id).await?;
        let doc = WorkflowDefinitionDocument::from_value(&instance.definition_snapshot)?;
        let action = match doc.actions.get(job.action_index) {
            Some(action)
                if action.key == job.action_key
                    && instance.state == InstanceState::Paused
                    && instance.current_action_index == job.action_index as i32 =>
            {
                action
            }
            _ => {
                debug!(instance_id = %instance.id, action_key = %job.action_key, state = %instance.state, "stale action job ignored");
                return Ok(None);
            }
        };

        let scope = self
            .observer
            .scope(OP_EXECUTE_ACTION, &action.kind)
            .field("instance_id", instance.id)
            .field("action_key", &action.key)
            .field("queued", true);

        if let Err(e) = self.resume(&mut instance).await {
            return Err(scope.fail(e));
        }
        let executor = action.action_type().and_then(|t| self.executors.get(&t));
        let result = match executor {
            Some(executor) => self.execute_with_retry(&action.key, executor.as_ref(), &job.request).await,
            None => Err(EngineError::Config(format!("no executor registered for {}", action.kind))),
        };

        match result {
            Ok(output) => {
                if let Err(e) = self.record_completed(&instance, job.action_index, action, &output).await {
                    return Err(scope.fail(e));
                }
                scope.end();
                let mut context = WorkflowInstanceContext::from_value(&instance.context);
                context.data.insert(action.key.clone(), output);
                self.save_progress(&mut instance, job.action_index + 1, &context).await?;
                self.run_instance(instance).await.map(Some)
            }
            Err(e) => {
                self.record_failed(&instance, job.action_index, action, &e).await;
                if let Err(fail_err) = self.fail(&mut instance, &e.to_string()).await {
                    let id = instance.id.to_string();
                    self.observer
                        .warn_engine(OP_EXECUTE_ACTION, &action.kind, &[("instance_id", id.as_str())], Some(&fail_err));
                }
                Err(scope.fail(e))
            }
        }
    }

    async fn execute_with_retry(
        &self,
        action_key: &str,
        executor: &dyn ActionExecutor,
        request: &ActionRequest,
    ) -> Result<Value, EngineError> {
        let mut attempts = 0u32;

        loop {
            match executor.execute(request).await {
                Ok(output) => return Ok(output),

                Err(ActionError::Fatal(msg)) => {
                    return Err(EngineError::ActionFatal {
                        action_key: action_key.to_owned(),
                        message: msg,
                    });
                }

                Err(ActionError::Retryable(msg)) => {
                    attempts += 1;
                    if attempts > self.config.executor.max_retries {
                        return Err(EngineError::ActionRetryExhausted {
                            action_key: action_key.to_owned(),
                            message: msg,
                        });
                    }

                    let delay = self.config.executor.retry_base_delay() * 2u32.pow(attempts.saturating_sub(1));

                    warn!(
                        "action '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        action_key, attempts, self.config.executor.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle records
    // -----------------------------------------------------------------------

    async fn record_completed(
        &self,
        instance: &WorkflowInstanceRow,
        index: usize,
        action: &WorkflowAction,
        output: &Value,
    ) -> Result<(), EngineError> {
        self.record_event(instance, EventType::ActionCompleted, &action.key, json!({ "actionIndex": index, "output": output }))
            .await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::ActionCompleted, topics::ACTION_COMPLETED, instance)
                .action(&action.key, index)
                .with("output", output.clone()),
        )
        .await;
        Ok(())
    }

    async fn record_skipped(
        &self,
        instance: &WorkflowInstanceRow,
        index: usize,
        action: &WorkflowAction,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.record_event(instance, EventType::ActionSkipped, &action.key, json!({ "actionIndex": index, "reason": reason }))
            .await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::ActionSkipped, topics::ACTION_SKIPPED, instance)
                .action(&action.key, index)
                .with("reason", json!(reason)),
        )
        .await;
        Ok(())
    }

    async fn record_failed(&self, instance: &WorkflowInstanceRow, index: usize, action: &WorkflowAction, err: &EngineError) {
        let details = json!({ "actionIndex": index, "error": err.to_string() });
        if let Err(db_err) = self.record_event(instance, EventType::ActionFailed, &action.key, details).await {
            let id = instance.id.to_string();
            self.observer.warn_engine(
                OP_EXECUTE_ACTION,
                &action.kind,
                &[("instance_id", id.as_str()), ("action_key", action.key.as_str())],
                Some(&db_err),
            );
        }
        self.publish(
            instance,
            LifecycleEvent::new(EventType::ActionFailed, topics::ACTION_FAILED, instance)
                .action(&action.key, index)
                .with("error", json!(err.to_string())),
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Values available to `{{name}}` placeholders in action params.
pub fn replacements(instance: &WorkflowInstanceRow, object: &Object) -> BTreeMap<String, String> {
    let context = WorkflowInstanceContext::from_value(&instance.context);
    BTreeMap::from([
        ("object_id".to_string(), object.id.clone()),
        ("object_type".to_string(), object.object_type.to_string()),
        ("instance_id".to_string(), instance.id.to_string()),
        ("definition_id".to_string(), instance.workflow_definition_id.to_string()),
        ("owner_id".to_string(), instance.owner_id.clone()),
        ("initiator".to_string(), context.trigger_user_id),
    ])
}

/// Replace known `{{name}}` placeholders in every string of `value`.
/// Unknown names are left as written.
pub fn apply_templates(value: &Value, replacements: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(
            TEMPLATE
                .replace_all(s, |caps: &regex::Captures<'_>| {
                    replacements
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| apply_templates(v, replacements)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), apply_templates(v, replacements)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn instance() -> WorkflowInstanceRow {
        NewWorkflowInstance {
            workflow_definition_id: Uuid::nil(),
            owner_id: "org".into(),
            state: InstanceState::Running,
            object_type: "Control".into(),
            object_id: "c1".into(),
            domain_key: None,
            context: json!({"triggerUserId": "u1"}),
            definition_snapshot: json!({}),
        }
        .into_row()
    }

    #[test]
    fn templates_replace_known_names_recursively() {
        let inst = instance();
        let obj = Object::new("Control", "c1");
        let params = json!({
            "url": "https://example.test/{{ object_type }}/{{object_id}}",
            "tags": ["{{initiator}}", "{{unknown}}"],
            "count": 3
        });

        let out = apply_templates(&params, &replacements(&inst, &obj));
        assert_eq!(
            out,
            json!({
                "url": "https://example.test/Control/c1",
                "tags": ["u1", "{{unknown}}"],
                "count": 3
            })
        );
    }
}
