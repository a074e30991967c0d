//! Pre-commit proposals.
//!
//! An update that touches fields gated by a `PRE_COMMIT` approval definition
//! is held back as one proposal per approval domain. Each proposal is linked
//! to the instance that gates it; the change is applied through the object
//! store once the instance's approvals pass.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use db::models::*;
use db::store::InstanceFilter;
use db::{DbError, WorkflowStore};

use crate::changeset::{normalize_strings, RecordedMutation};
use crate::domain::{compute_proposal_hash, domain_changes_for_definition, DomainChanges};
use crate::emit::{topics, LifecycleEvent};
use crate::error::{CreationStage, WorkflowCreationError};
use crate::executor::{PendingProposal, TriggerInput, WorkflowEngine};
use crate::models::{
    ApprovalSubmissionMode, AssignmentApprovalMetadata, Caller, WorkflowDefinitionDocument, WorkflowInstanceContext,
};
use crate::object::Object;
use crate::observability::{OP_PROPOSAL, OP_ROUTE_MUTATION};
use crate::EngineError;

/// A proposal a mutation was routed to.
#[derive(Debug, Clone)]
pub struct RoutedProposal {
    pub proposal: WorkflowProposalRow,
    /// The instance gating the proposal.
    pub instance_id: Option<Uuid>,
    /// `false` when an open proposal for the domain was revised instead.
    pub created: bool,
}

/// Result of [`WorkflowEngine::route_mutation`].
#[derive(Debug, Clone, Default)]
pub struct RouteOutcome {
    pub proposals: Vec<RoutedProposal>,
    /// Fields the host must not write; they now wait on approval.
    pub held_fields: Vec<String>,
}

impl RouteOutcome {
    pub fn is_gated(&self) -> bool {
        !self.proposals.is_empty()
    }
}

impl<S: WorkflowStore> WorkflowEngine<S> {
    /// Hold back the parts of an update that pre-commit approval definitions
    /// gate, before the host applies it.
    ///
    /// Fields not listed in [`RouteOutcome::held_fields`] may be written as
    /// usual; the host should then call [`WorkflowEngine::handle_mutation`]
    /// for the remainder.
    #[instrument(skip(self, caller, mutation), fields(object_type = %mutation.object_type, object_id = %mutation.object_id))]
    pub async fn route_mutation(&self, caller: &Caller, mutation: &RecordedMutation) -> Result<RouteOutcome, EngineError> {
        let scope = self
            .observer
            .scope(OP_ROUTE_MUTATION, &mutation.operation)
            .field("object_type", &mutation.object_type)
            .field("object_id", &mutation.object_id);

        if !self.config.is_enabled() {
            scope.skip("workflows disabled");
            return Ok(RouteOutcome::default());
        }
        let owner_id = match caller.require_organization() {
            Ok(owner) => owner.to_string(),
            Err(e) => return Err(scope.fail(e)),
        };
        if mutation.object_id.trim().is_empty() {
            return Err(scope.fail(EngineError::MissingObjectId));
        }

        let input = self.trigger_input(mutation);
        if input.event_type != "UPDATE" {
            scope.skip("only updates are routed");
            return Ok(RouteOutcome::default());
        }
        if input.proposed_changes.is_empty() {
            scope.skip("no eligible changes");
            return Ok(RouteOutcome::default());
        }

        match self.route_changes(&owner_id, mutation, &input).await {
            Ok(outcome) => {
                scope
                    .field("proposals", outcome.proposals.len())
                    .field("held_fields", outcome.held_fields.len())
                    .end();
                Ok(outcome)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    async fn route_changes(
        &self,
        owner_id: &str,
        mutation: &RecordedMutation,
        input: &TriggerInput,
    ) -> Result<RouteOutcome, EngineError> {
        let object = self.load_object(&mutation.object_type, &mutation.object_id).await?;
        let mut outcome = RouteOutcome::default();
        let mut held = Vec::new();

        for (row, doc) in self.candidate_definitions(owner_id, &object, input).await? {
            if !doc.gates_before_commit() {
                continue;
            }
            let domains = domain_changes_for_definition(&doc, &mutation.object_type, &input.proposed_changes)?;
            for domain in domains {
                match self.upsert_proposal(owner_id, &row, &doc, &object, input, &domain).await {
                    Ok(routed) => {
                        held.extend(domain.changes.keys().cloned());
                        outcome.proposals.push(routed);
                    }
                    Err(EngineError::WorkflowAlreadyActive(existing)) => {
                        // An active instance without an open proposal; the change is not held.
                        let existing = existing.to_string();
                        self.observer.warn_listener(
                            OP_ROUTE_MUTATION,
                            &mutation.operation,
                            &[("domain_key", domain.domain_key.as_str()), ("instance_id", existing.as_str())],
                            None,
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        outcome.held_fields = normalize_strings(held);
        Ok(outcome)
    }

    /// Revise the domain's open proposal, or create one with its instance.
    async fn upsert_proposal(
        &self,
        owner_id: &str,
        row: &WorkflowDefinitionRow,
        doc: &WorkflowDefinitionDocument,
        object: &Object,
        input: &TriggerInput,
        domain: &DomainChanges,
    ) -> Result<RoutedProposal, EngineError> {
        let hash = compute_proposal_hash(&domain.changes)?;
        if let Some(existing) = self.find_open_proposal(owner_id, object, &domain.domain_key).await? {
            match self.proposal_instance(&existing).await? {
                Some(instance) if !instance.state.is_terminal() => {
                    return self.revise_proposal(existing, doc, input, domain, hash).await;
                }
                instance => self.retire_stale_proposal(existing, instance.map(|i| i.id)).await?,
            }
        }

        self.ensure_can_trigger(owner_id, row, object, Some(&domain.domain_key)).await?;

        let auto_submit = doc.approval_submission_mode == ApprovalSubmissionMode::AutoSubmit;
        let pending = PendingProposal {
            domain: domain.clone(),
            hash: hash.clone(),
            state: if auto_submit { ProposalState::Submitted } else { ProposalState::Draft },
            submitted_by: (auto_submit && !input.user_id.is_empty()).then(|| input.user_id.clone()),
        };
        let state = if auto_submit { InstanceState::Running } else { InstanceState::Paused };
        let domain_input = input.for_domain(domain);

        let created = self
            .create_workflow_rows(owner_id, row, doc, object, &domain_input, state, Some(pending))
            .await;
        let (instance, proposal) = match created {
            Ok((instance, Some(proposal))) => (instance, proposal),
            Ok((_, None)) => return Err(DbError::NotFound.into()),
            Err(EngineError::Creation(WorkflowCreationError {
                stage: CreationStage::Proposal,
                source: DbError::Conflict(_),
            })) => {
                // Another writer opened the slot between lookup and insert.
                let Some(existing) = self.find_open_proposal(owner_id, object, &domain.domain_key).await? else {
                    return Err(DbError::Conflict(format!("proposal slot '{}' is taken", domain.domain_key)).into());
                };
                return self.revise_proposal(existing, doc, input, domain, hash).await;
            }
            Err(e) => return Err(e),
        };

        self.record_triggered(&instance, &domain_input).await?;
        info!(proposal_id = %proposal.id, domain_key = %proposal.domain_key, state = %proposal.state, "proposal created");

        let instance_id = instance.id;
        if auto_submit {
            self.run_instance(instance).await?;
        } else {
            self.record_awaiting_submission(&instance).await?;
        }

        Ok(RoutedProposal {
            proposal: self.store.get_proposal(proposal.id).await?,
            instance_id: Some(instance_id),
            created: true,
        })
    }

    /// Close an open proposal whose instance has ended or vanished. A
    /// submitted proposal is superseded, a draft rejected.
    async fn retire_stale_proposal(
        &self,
        mut proposal: WorkflowProposalRow,
        instance_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let next = if proposal.state.can_transition_to(ProposalState::Superseded) {
            ProposalState::Superseded
        } else {
            ProposalState::Rejected
        };
        transition_proposal(&mut proposal, next)?;
        self.store.update_proposal(&proposal).await?;
        warn!(
            proposal_id = %proposal.id,
            instance_id = ?instance_id,
            domain_key = %proposal.domain_key,
            state = %proposal.state,
            "stale proposal closed; opening a new one"
        );
        Ok(())
    }

    async fn record_awaiting_submission(&self, instance: &WorkflowInstanceRow) -> Result<(), EngineError> {
        let reason = "awaiting submission";
        self.record_event(instance, EventType::InstancePaused, "", json!({ "reason": reason })).await?;
        self.publish(
            instance,
            LifecycleEvent::new(EventType::InstancePaused, topics::INSTANCE_PAUSED, instance).with("reason", json!(reason)),
        )
        .await;
        Ok(())
    }

    /// Replace an open proposal's changes. An unchanged hash is a no-op.
    async fn revise_proposal(
        &self,
        mut proposal: WorkflowProposalRow,
        doc: &WorkflowDefinitionDocument,
        input: &TriggerInput,
        domain: &DomainChanges,
        hash: String,
    ) -> Result<RoutedProposal, EngineError> {
        let instance = self.proposal_instance(&proposal).await?;
        let instance_id = instance.as_ref().map(|i| i.id);
        if proposal.proposed_hash == hash {
            return Ok(RoutedProposal { proposal, instance_id, created: false });
        }

        proposal.changes = Value::Object(domain.changes.clone());
        proposal.proposed_hash = hash.clone();
        proposal.revision += 1;
        let submit_now =
            proposal.state == ProposalState::Draft && doc.approval_submission_mode == ApprovalSubmissionMode::AutoSubmit;
        if submit_now {
            proposal.state = ProposalState::Submitted;
            proposal.submitted_at = Some(Utc::now());
            proposal.submitted_by = (!input.user_id.is_empty()).then(|| input.user_id.clone());
        }
        self.store.update_proposal(&proposal).await?;
        info!(proposal_id = %proposal.id, revision = proposal.revision, "proposal revised");

        if let Some(mut instance) = instance {
            let mut context = WorkflowInstanceContext::from_value(&instance.context);
            context.trigger_changed_fields = domain.changes.keys().cloned().collect();
            context.trigger_proposed_changes = domain.changes.clone();
            if !input.user_id.is_empty() {
                context.trigger_user_id = input.user_id.clone();
            }
            let index = instance.current_action_index.max(0) as usize;
            self.save_progress(&mut instance, index, &context).await?;
            self.invalidate_stale_decisions(&instance, &hash).await?;
            if submit_now && instance.state == InstanceState::Paused {
                self.resume(&mut instance).await?;
                self.run_instance(instance).await?;
            }
        }

        Ok(RoutedProposal {
            proposal: self.store.get_proposal(proposal.id).await?,
            instance_id,
            created: false,
        })
    }

    /// Approvals given for an older revision no longer count.
    async fn invalidate_stale_decisions(&self, instance: &WorkflowInstanceRow, hash: &str) -> Result<(), EngineError> {
        for mut assignment in self.store.list_assignments(instance.id).await? {
            let mut metadata: AssignmentApprovalMetadata =
                serde_json::from_value(assignment.metadata.clone()).unwrap_or_default();
            if metadata.proposed_hash.is_empty() || metadata.proposed_hash == hash {
                continue;
            }
            let was_approved = assignment.status == AssignmentStatus::Approved;
            metadata.proposed_hash = hash.to_string();
            assignment.metadata = serde_json::to_value(&metadata)?;
            if was_approved {
                assignment.status = AssignmentStatus::Pending;
                assignment.decided_by = None;
                assignment.decided_at = None;
                assignment.notes = None;
            }
            self.store.update_assignment(&assignment).await?;

            if was_approved {
                let details = json!({
                    "assignmentId": assignment.id,
                    "assignmentKey": assignment.assignment_key,
                    "proposedHash": hash,
                });
                self.record_event(instance, EventType::AssignmentInvalidated, &assignment.action_key, details)
                    .await?;
            }
        }
        Ok(())
    }

    /// The object's open proposal for `domain_key`, submitted ones first.
    async fn find_open_proposal(
        &self,
        owner_id: &str,
        object: &Object,
        domain_key: &str,
    ) -> Result<Option<WorkflowProposalRow>, EngineError> {
        let filter = self.registry.object_ref_filter(object)?;
        let refs = self.store.find_object_refs(owner_id, &filter).await?;
        if refs.is_empty() {
            return Ok(None);
        }

        let mut query = ProposalQuery {
            owner_id: owner_id.to_string(),
            object_ref_ids: refs.iter().map(|r| r.id).collect(),
            domain_key: domain_key.to_string(),
            states: vec![ProposalState::Submitted],
        };
        if let Some(submitted) = self.store.find_proposals(&query).await?.into_iter().next() {
            return Ok(Some(submitted));
        }
        query.states = ProposalState::OPEN.to_vec();
        Ok(self.store.find_proposals(&query).await?.into_iter().next())
    }

    /// The instance gating `proposal`.
    pub async fn proposal_instance(&self, proposal: &WorkflowProposalRow) -> Result<Option<WorkflowInstanceRow>, EngineError> {
        let filter = InstanceFilter {
            owner_id: proposal.owner_id.clone(),
            object_type: proposal.object_type.clone(),
            object_id: proposal.object_id.clone(),
            workflow_definition_id: None,
            domain_key: Some(proposal.domain_key.clone()),
            states: Vec::new(),
            created_after: None,
        };
        Ok(self
            .store
            .find_instances(&filter)
            .await?
            .into_iter()
            .find(|i| i.workflow_proposal_id == Some(proposal.id)))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Submit a draft and start its instance's approvals.
    pub async fn submit_proposal(&self, caller: &Caller, proposal_id: Uuid) -> Result<WorkflowProposalRow, EngineError> {
        let scope = self.observer.scope(OP_PROPOSAL, "submit").field("proposal_id", proposal_id);
        let result: Result<WorkflowProposalRow, EngineError> = async {
            let subject = caller.require_subject()?.to_string();
            let mut proposal = self.load_proposal(caller, proposal_id).await?;
            transition_proposal(&mut proposal, ProposalState::Submitted)?;
            proposal.submitted_at = Some(Utc::now());
            proposal.submitted_by = Some(subject);
            self.store.update_proposal(&proposal).await?;

            if let Some(mut instance) = self.proposal_instance(&proposal).await? {
                if instance.state == InstanceState::Paused {
                    self.resume(&mut instance).await?;
                    self.run_instance(instance).await?;
                }
            }
            Ok(self.store.get_proposal(proposal_id).await?)
        }
        .await;

        match result {
            Ok(proposal) => {
                scope.field("state", proposal.state).end();
                Ok(proposal)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    /// Reject a submitted proposal and fail its instance.
    pub async fn reject_proposal(&self, caller: &Caller, proposal_id: Uuid) -> Result<WorkflowProposalRow, EngineError> {
        self.close_proposal(caller, proposal_id, ProposalState::Rejected).await
    }

    /// Mark a submitted proposal superseded and fail its instance.
    pub async fn supersede_proposal(&self, caller: &Caller, proposal_id: Uuid) -> Result<WorkflowProposalRow, EngineError> {
        self.close_proposal(caller, proposal_id, ProposalState::Superseded).await
    }

    async fn close_proposal(
        &self,
        caller: &Caller,
        proposal_id: Uuid,
        next: ProposalState,
    ) -> Result<WorkflowProposalRow, EngineError> {
        let trigger = next.to_string();
        let scope = self.observer.scope(OP_PROPOSAL, &trigger).field("proposal_id", proposal_id);
        let result: Result<WorkflowProposalRow, EngineError> = async {
            let mut proposal = self.load_proposal(caller, proposal_id).await?;
            transition_proposal(&mut proposal, next)?;
            self.store.update_proposal(&proposal).await?;
            if let Some(mut instance) = self.proposal_instance(&proposal).await? {
                self.fail(&mut instance, &format!("proposal {}", trigger.to_ascii_lowercase())).await?;
            }
            Ok(proposal)
        }
        .await;

        match result {
            Ok(proposal) => {
                scope.end();
                Ok(proposal)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    /// Write a submitted proposal's changes to its object.
    pub async fn apply_proposal(&self, caller: &Caller, proposal_id: Uuid) -> Result<WorkflowProposalRow, EngineError> {
        let scope = self.observer.scope(OP_PROPOSAL, "apply").field("proposal_id", proposal_id);
        let result: Result<WorkflowProposalRow, EngineError> = async {
            let mut proposal = self.load_proposal(caller, proposal_id).await?;
            self.apply_proposal_row(&mut proposal).await?;
            Ok(proposal)
        }
        .await;

        match result {
            Ok(proposal) => {
                scope.end();
                Ok(proposal)
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    /// Apply the instance's linked proposal if it is still submitted.
    pub(crate) async fn apply_linked_proposal(&self, instance: &WorkflowInstanceRow) -> Result<(), EngineError> {
        let Some(proposal_id) = instance.workflow_proposal_id else {
            return Ok(());
        };
        let mut proposal = self.store.get_proposal(proposal_id).await?;
        if proposal.state == ProposalState::Submitted {
            self.apply_proposal_row(&mut proposal).await?;
        }
        Ok(())
    }

    async fn apply_proposal_row(&self, proposal: &mut WorkflowProposalRow) -> Result<(), EngineError> {
        if !proposal.state.can_transition_to(ProposalState::Applied) {
            return Err(EngineError::InvalidProposalTransition {
                from: proposal.state,
                to: ProposalState::Applied,
            });
        }
        let changes = match &proposal.changes {
            Value::Object(map) => map.clone(),
            _ => Default::default(),
        };
        self.check_eligible(&proposal.object_type, changes.keys())?;

        match self
            .objects
            .apply_field_updates(&proposal.object_type, &proposal.object_id, &changes)
            .await
        {
            Ok(()) => {}
            Err(DbError::NotFound) => {
                return Err(EngineError::ObjectNotFound {
                    object_type: proposal.object_type.clone(),
                    object_id: proposal.object_id.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        proposal.state = ProposalState::Applied;
        self.store.update_proposal(proposal).await?;
        info!(proposal_id = %proposal.id, fields = changes.len(), "proposal applied");
        Ok(())
    }

    async fn load_proposal(&self, caller: &Caller, proposal_id: Uuid) -> Result<WorkflowProposalRow, EngineError> {
        let owner_id = caller.require_organization()?;
        let proposal = self.store.get_proposal(proposal_id).await?;
        if proposal.owner_id != owner_id {
            return Err(DbError::NotFound.into());
        }
        Ok(proposal)
    }
}

fn transition_proposal(proposal: &mut WorkflowProposalRow, next: ProposalState) -> Result<(), EngineError> {
    if !proposal.state.can_transition_to(next) {
        return Err(EngineError::InvalidProposalTransition { from: proposal.state, to: next });
    }
    proposal.state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(state: ProposalState) -> WorkflowProposalRow {
        let now = Utc::now();
        WorkflowProposalRow {
            id: Uuid::new_v4(),
            workflow_object_ref_id: Uuid::new_v4(),
            owner_id: "org".into(),
            object_type: "Control".into(),
            object_id: "c1".into(),
            domain_key: "Control:status".into(),
            state,
            changes: json!({}),
            proposed_hash: String::new(),
            revision: 1,
            submitted_at: None,
            submitted_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn proposal_transitions_follow_the_state_machine() {
        let mut p = proposal(ProposalState::Draft);
        transition_proposal(&mut p, ProposalState::Submitted).unwrap();
        assert_eq!(p.state, ProposalState::Submitted);

        let err = transition_proposal(&mut p, ProposalState::Draft).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProposalTransition { .. }));

        let mut draft = proposal(ProposalState::Draft);
        transition_proposal(&mut draft, ProposalState::Rejected).unwrap();
        assert!(transition_proposal(&mut proposal(ProposalState::Draft), ProposalState::Superseded).is_err());

        let mut applied = proposal(ProposalState::Applied);
        assert!(transition_proposal(&mut applied, ProposalState::Rejected).is_err());
        assert_eq!(applied.state, ProposalState::Applied);
    }

    #[test]
    fn route_outcome_is_gated_only_with_proposals() {
        let mut outcome = RouteOutcome::default();
        assert!(!outcome.is_gated());
        outcome.proposals.push(RoutedProposal {
            proposal: proposal(ProposalState::Draft),
            instance_id: None,
            created: true,
        });
        assert!(outcome.is_gated());
    }
}
