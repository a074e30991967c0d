//! Approval and review decisions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use db::models::*;
use db::{DbError, WorkflowStore};

use crate::emit::{topics, LifecycleEvent};
use crate::executor::WorkflowEngine;
use crate::models::{ActionType, AssignmentApprovalMetadata, Caller, WorkflowDefinitionDocument, WorkflowInstanceContext};
use crate::observability::OP_COMPLETE_ASSIGNMENT;
use crate::EngineError;

/// Where an action's assignments stand after a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuorumOutcome {
    Pending,
    Approved,
    Rejected,
}

impl QuorumOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Decide an action's assignments.
///
/// With `required_count == 0` every assignment must approve and any
/// rejection fails. Otherwise `required_count` approvals (capped at the
/// number of assignments) pass, and the action fails once that is out of
/// reach.
pub fn evaluate_quorum(assignments: &[WorkflowAssignmentRow], metadata: &AssignmentApprovalMetadata) -> QuorumOutcome {
    let count = |status: AssignmentStatus| assignments.iter().filter(|a| a.status == status).count();
    let approved = count(AssignmentStatus::Approved);
    let rejected = count(AssignmentStatus::Rejected);
    let pending = count(AssignmentStatus::Pending);

    if metadata.required_count == 0 {
        if rejected > 0 {
            return QuorumOutcome::Rejected;
        }
        return if pending == 0 && approved > 0 {
            QuorumOutcome::Approved
        } else {
            QuorumOutcome::Pending
        };
    }

    let needed = metadata.required_count.min(assignments.len()).max(1);
    if approved >= needed {
        QuorumOutcome::Approved
    } else if approved + pending < needed {
        QuorumOutcome::Rejected
    } else {
        QuorumOutcome::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentDecision {
    Approve,
    Reject,
}

impl AssignmentDecision {
    fn status(self) -> AssignmentStatus {
        match self {
            Self::Approve => AssignmentStatus::Approved,
            Self::Reject => AssignmentStatus::Rejected,
        }
    }
}

/// Outcome of [`WorkflowEngine::complete_assignment`].
#[derive(Debug, Clone)]
pub struct AssignmentResolution {
    pub assignment: WorkflowAssignmentRow,
    pub outcome: QuorumOutcome,
    /// The instance after re-evaluation.
    pub instance: WorkflowInstanceRow,
}

impl<S: WorkflowStore> WorkflowEngine<S> {
    /// Record the caller's decision on an assignment and move its instance
    /// on: a rejection or unreachable quorum fails it, a met quorum resumes
    /// it at the next action.
    #[instrument(skip(self, caller, notes), fields(assignment_id = %assignment_id))]
    pub async fn complete_assignment(
        &self,
        caller: &Caller,
        assignment_id: Uuid,
        decision: AssignmentDecision,
        notes: Option<String>,
    ) -> Result<AssignmentResolution, EngineError> {
        let trigger = decision.status().to_string();
        let scope = self
            .observer
            .scope(OP_COMPLETE_ASSIGNMENT, &trigger)
            .field("assignment_id", assignment_id);

        match self.decide(caller, assignment_id, decision, notes).await {
            Ok(resolution) => {
                scope
                    .field("instance_id", resolution.instance.id)
                    .field("quorum", resolution.outcome.as_str())
                    .end();
                Ok(resolution)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    async fn decide(
        &self,
        caller: &Caller,
        assignment_id: Uuid,
        decision: AssignmentDecision,
        notes: Option<String>,
    ) -> Result<AssignmentResolution, EngineError> {
        let owner_id = caller.require_organization()?;
        let user_id = caller.require_subject()?;

        let mut assignment = self.store.get_assignment(assignment_id).await?;
        if assignment.owner_id != owner_id {
            return Err(DbError::NotFound.into());
        }
        if assignment.status.is_decided() {
            return Err(EngineError::AssignmentAlreadyDecided(assignment_id));
        }
        let targets = self.store.list_assignment_targets(assignment_id).await?;
        if !targets.iter().any(|t| t.target_user_id == user_id) {
            return Err(EngineError::NotAssignmentTarget {
                assignment_id,
                user_id: user_id.to_string(),
            });
        }
        let mut instance = self.store.get_instance(assignment.workflow_instance_id).await?;
        if instance.state.is_terminal() {
            return Err(EngineError::InvalidInstanceTransition {
                from: instance.state,
                to: InstanceState::Running,
            });
        }

        assignment.status = decision.status();
        assignment.decided_by = Some(user_id.to_string());
        assignment.decided_at = Some(Utc::now());
        assignment.notes = notes;
        self.store.update_assignment(&assignment).await?;
        self.record_resolved(&instance, &assignment).await?;

        let metadata: AssignmentApprovalMetadata = serde_json::from_value(assignment.metadata.clone()).unwrap_or_default();
        let siblings: Vec<WorkflowAssignmentRow> = self
            .store
            .list_assignments(instance.id)
            .await?
            .into_iter()
            .filter(|a| a.action_key == assignment.action_key)
            .collect();
        let outcome = evaluate_quorum(&siblings, &metadata);

        match outcome {
            QuorumOutcome::Pending => {}
            QuorumOutcome::Rejected => {
                let reason = format!("'{}' was rejected", assignment.action_key);
                self.fail(&mut instance, &reason).await?;
            }
            QuorumOutcome::Approved => {
                let waiting = instance.state == InstanceState::Paused
                    && instance.current_action_index == metadata.action_index as i32;
                if waiting {
                    instance = self.advance_past(instance, &metadata, &siblings).await?;
                }
            }
        }

        Ok(AssignmentResolution { assignment, outcome, instance })
    }

    /// Finish the paused approval action and run the rest of the instance.
    async fn advance_past(
        &self,
        mut instance: WorkflowInstanceRow,
        metadata: &AssignmentApprovalMetadata,
        decided: &[WorkflowAssignmentRow],
    ) -> Result<WorkflowInstanceRow, EngineError> {
        let doc = WorkflowDefinitionDocument::from_value(&instance.definition_snapshot)?;
        let index = metadata.action_index;

        let approvers: Vec<&str> = decided
            .iter()
            .filter(|a| a.status == AssignmentStatus::Approved)
            .filter_map(|a| a.decided_by.as_deref())
            .collect();
        let output = json!({ "status": AssignmentStatus::Approved, "approvers": approvers });

        let later_gate = doc
            .actions
            .iter()
            .skip(index + 1)
            .any(|a| a.action_type() == Some(ActionType::RequestApproval));
        if !later_gate {
            self.apply_linked_proposal(&instance).await?;
        }

        self.record_event(
            &instance,
            EventType::ActionCompleted,
            &metadata.action_key,
            json!({ "actionIndex": index, "output": output }),
        )
        .await?;
        self.publish(
            &instance,
            LifecycleEvent::new(EventType::ActionCompleted, topics::ACTION_COMPLETED, &instance)
                .action(&metadata.action_key, index)
                .with("output", output.clone()),
        )
        .await;

        let mut context = WorkflowInstanceContext::from_value(&instance.context);
        context.data.insert(metadata.action_key.clone(), output);
        self.save_progress(&mut instance, index + 1, &context).await?;
        self.resume(&mut instance).await?;
        info!(instance_id = %instance.id, action_key = %metadata.action_key, "approval quorum met; resuming");
        self.run_instance(instance).await
    }

    async fn record_resolved(&self, instance: &WorkflowInstanceRow, assignment: &WorkflowAssignmentRow) -> Result<(), EngineError> {
        let details = json!({
            "assignmentId": assignment.id,
            "assignmentKey": assignment.assignment_key,
            "status": assignment.status,
            "decidedBy": assignment.decided_by,
        });
        self.record_event(instance, EventType::AssignmentResolved, &assignment.action_key, details).await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::AssignmentResolved, topics::ASSIGNMENT_RESOLVED, instance)
                .with("actionKey", json!(assignment.action_key))
                .with("assignmentId", json!(assignment.id))
                .with("status", json!(assignment.status)),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn assignments(statuses: &[AssignmentStatus]) -> Vec<WorkflowAssignmentRow> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut row = NewWorkflowAssignment {
                    workflow_instance_id: Uuid::nil(),
                    owner_id: "org".into(),
                    assignment_key: format!("approval_a_u{i}"),
                    action_key: "a".into(),
                    required: true,
                    label: None,
                    metadata: json!({}),
                }
                .into_row();
                row.status = *status;
                row
            })
            .collect()
    }

    fn quorum(required_count: usize) -> AssignmentApprovalMetadata {
        AssignmentApprovalMetadata {
            action_key: "a".into(),
            required: true,
            required_count,
            ..Default::default()
        }
    }

    use AssignmentStatus::{Approved, Pending, Rejected};

    #[test]
    fn unanimous_quorum() {
        assert_eq!(evaluate_quorum(&assignments(&[Approved, Pending]), &quorum(0)), QuorumOutcome::Pending);
        assert_eq!(evaluate_quorum(&assignments(&[Approved, Approved]), &quorum(0)), QuorumOutcome::Approved);
        assert_eq!(evaluate_quorum(&assignments(&[Approved, Rejected]), &quorum(0)), QuorumOutcome::Rejected);
        assert_eq!(evaluate_quorum(&[], &quorum(0)), QuorumOutcome::Pending);
    }

    #[test]
    fn counted_quorum_tolerates_rejections_while_reachable() {
        let m = quorum(2);
        assert_eq!(evaluate_quorum(&assignments(&[Rejected, Approved, Pending]), &m), QuorumOutcome::Pending);
        assert_eq!(evaluate_quorum(&assignments(&[Rejected, Approved, Approved]), &m), QuorumOutcome::Approved);
        assert_eq!(evaluate_quorum(&assignments(&[Rejected, Rejected, Pending]), &m), QuorumOutcome::Rejected);
    }

    #[test]
    fn counted_quorum_is_capped_at_assignment_count() {
        assert_eq!(evaluate_quorum(&assignments(&[Approved]), &quorum(3)), QuorumOutcome::Approved);
    }
}
