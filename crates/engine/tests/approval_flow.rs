//! End-to-end approval scenarios: pre-commit routing to proposals,
//! submission, assignment decisions and emission reconciliation.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use uuid::Uuid;

use db::models::*;
use db::{MemoryObjectStore, MemoryStore, ObjectStore, WorkflowStore};
use engine::{
    AssignmentDecision, Caller, EngineError, ExecutorConfig, QuorumOutcome, RecordedMutation, Reconciler,
    ReconcilerConfig, WorkflowConfig, WorkflowEngine, WorkflowRegistry,
};
use queue::MemoryRuntime;

struct Fixture {
    store: Arc<MemoryStore>,
    objects: Arc<MemoryObjectStore>,
    runtime: Arc<MemoryRuntime>,
    engine: WorkflowEngine<MemoryStore>,
}

fn fixture() -> Fixture {
    fixture_with(
        WorkflowRegistry::new()
            .bind("Control", "control_id")
            .with_eligible_fields("Control", ["status", "owner", "title"]),
    )
}

fn fixture_with(registry: WorkflowRegistry) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    objects.insert_object("Control", "c1", "org", json!({"status": "DRAFT", "owner": "u1"}));
    let runtime = Arc::new(MemoryRuntime::new());
    let config = WorkflowConfig::default().with_enabled(true).with_executor(ExecutorConfig {
        max_retries: 1,
        retry_base_delay_ms: 1,
        ..Default::default()
    });
    let engine = WorkflowEngine::new(store.clone(), objects.clone(), Arc::new(registry), config)
        .with_runtime(runtime.clone());
    Fixture { store, objects, runtime, engine }
}

async fn define(store: &MemoryStore, definition: Value) -> Uuid {
    store
        .create_definition(NewWorkflowDefinition {
            owner_id: "org".into(),
            name: "status approval".into(),
            schema_type: "Control".into(),
            active: true,
            cooldown_seconds: 0,
            definition,
        })
        .await
        .unwrap()
        .id
}

fn approval(key: &str, fields: &[&str], users: &[&str], required_count: i64) -> Value {
    let targets: Vec<Value> = users.iter().map(|u| json!({"type": "USER", "id": u})).collect();
    json!({
        "key": key,
        "type": "REQUEST_APPROVAL",
        "params": {"targets": targets, "fields": fields, "requiredCount": required_count}
    })
}

fn pre_commit(mode: &str, actions: Value) -> Value {
    json!({
        "schemaType": "Control",
        "approvalTiming": "PRE_COMMIT",
        "approvalSubmissionMode": mode,
        "triggers": [{"operation": "UPDATE", "fields": ["status", "owner"]}],
        "actions": actions
    })
}

fn as_user(user: &str) -> Caller {
    Caller::new("org", user)
}

fn set_status(value: &str) -> RecordedMutation {
    RecordedMutation::new("UPDATE", "Control", "c1")
        .set("status", json!(value))
        .by("u1")
}

async fn status_of(objects: &MemoryObjectStore) -> Value {
    objects.load_object("Control", "c1").await.unwrap()["status"].clone()
}

async fn assignment_for(store: &MemoryStore, instance_id: Uuid, user: &str) -> WorkflowAssignmentRow {
    store
        .list_assignments(instance_id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.assignment_key.ends_with(&format!("_{user}")))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Routing and submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_submit_flow_applies_change_after_unanimous_approval() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("MANUAL_SUBMIT", json!([approval("status_ok", &["status"], &["u2", "u3"], 0)])),
    )
    .await;

    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    assert!(routed.is_gated());
    assert_eq!(routed.held_fields, vec!["status".to_string()]);
    let proposal = &routed.proposals[0];
    assert!(proposal.created);
    assert_eq!(proposal.proposal.state, ProposalState::Draft);
    assert_eq!(proposal.proposal.domain_key, "Control:status");

    let instance_id = proposal.instance_id.unwrap();
    let instance = f.store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Paused);
    assert!(f.store.list_assignments(instance_id).await.unwrap().is_empty());

    // Committed-path handling leaves pre-commit definitions alone.
    let started = f.engine.handle_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    assert!(started.is_empty());

    let submitted = f.engine.submit_proposal(&as_user("u1"), proposal.proposal.id).await.unwrap();
    assert_eq!(submitted.state, ProposalState::Submitted);
    assert_eq!(submitted.submitted_by.as_deref(), Some("u1"));
    assert_eq!(f.store.list_assignments(instance_id).await.unwrap().len(), 2);

    let first = assignment_for(&f.store, instance_id, "u2").await;
    let resolution = f
        .engine
        .complete_assignment(&as_user("u2"), first.id, AssignmentDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(resolution.outcome, QuorumOutcome::Pending);
    assert_eq!(resolution.instance.state, InstanceState::Paused);
    assert_eq!(status_of(&f.objects).await, json!("DRAFT"));

    let second = assignment_for(&f.store, instance_id, "u3").await;
    let resolution = f
        .engine
        .complete_assignment(&as_user("u3"), second.id, AssignmentDecision::Approve, Some("fine".into()))
        .await
        .unwrap();
    assert_eq!(resolution.outcome, QuorumOutcome::Approved);
    assert_eq!(resolution.instance.state, InstanceState::Completed);
    assert_eq!(status_of(&f.objects).await, json!("ACTIVE"));

    let applied = f.store.get_proposal(proposal.proposal.id).await.unwrap();
    assert_eq!(applied.state, ProposalState::Applied);
}

#[tokio::test]
async fn rejection_fails_instance_and_rejects_proposal() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("AUTO_SUBMIT", json!([approval("status_ok", &["status"], &["u2", "u3"], 0)])),
    )
    .await;

    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let proposal = &routed.proposals[0];
    assert_eq!(proposal.proposal.state, ProposalState::Submitted);
    let instance_id = proposal.instance_id.unwrap();

    let assignment = assignment_for(&f.store, instance_id, "u2").await;
    let resolution = f
        .engine
        .complete_assignment(&as_user("u2"), assignment.id, AssignmentDecision::Reject, None)
        .await
        .unwrap();

    assert_eq!(resolution.outcome, QuorumOutcome::Rejected);
    assert_eq!(resolution.instance.state, InstanceState::Failed);
    let rejected = f.store.get_proposal(proposal.proposal.id).await.unwrap();
    assert_eq!(rejected.state, ProposalState::Rejected);
    assert_eq!(status_of(&f.objects).await, json!("DRAFT"));

    // The other approver can no longer act on a failed instance.
    let other = assignment_for(&f.store, instance_id, "u3").await;
    let err = f
        .engine
        .complete_assignment(&as_user("u3"), other.id, AssignmentDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInstanceTransition { .. }));
}

#[tokio::test]
async fn counted_quorum_survives_a_single_rejection() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("AUTO_SUBMIT", json!([approval("status_ok", &["status"], &["u2", "u3"], 1)])),
    )
    .await;
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let instance_id = routed.proposals[0].instance_id.unwrap();

    let u2 = assignment_for(&f.store, instance_id, "u2").await;
    let resolution = f
        .engine
        .complete_assignment(&as_user("u2"), u2.id, AssignmentDecision::Reject, None)
        .await
        .unwrap();
    assert_eq!(resolution.outcome, QuorumOutcome::Pending);

    let u3 = assignment_for(&f.store, instance_id, "u3").await;
    let resolution = f
        .engine
        .complete_assignment(&as_user("u3"), u3.id, AssignmentDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(resolution.outcome, QuorumOutcome::Approved);
    assert_eq!(resolution.instance.state, InstanceState::Completed);
    assert_eq!(status_of(&f.objects).await, json!("ACTIVE"));
}

#[tokio::test]
async fn only_targets_decide_and_only_once() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("AUTO_SUBMIT", json!([approval("status_ok", &["status"], &["u2", "u3"], 0)])),
    )
    .await;
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let instance_id = routed.proposals[0].instance_id.unwrap();
    let assignment = assignment_for(&f.store, instance_id, "u2").await;

    let err = f
        .engine
        .complete_assignment(&as_user("u9"), assignment.id, AssignmentDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAssignmentTarget { ref user_id, .. } if user_id == "u9"));

    f.engine
        .complete_assignment(&as_user("u2"), assignment.id, AssignmentDecision::Approve, None)
        .await
        .unwrap();
    let err = f
        .engine
        .complete_assignment(&as_user("u2"), assignment.id, AssignmentDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AssignmentAlreadyDecided(id) if id == assignment.id));
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rerouting_revises_the_open_proposal() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("MANUAL_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;

    let first = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let second = f.engine.route_mutation(&as_user("u1"), &set_status("RETIRED")).await.unwrap();
    let third = f.engine.route_mutation(&as_user("u1"), &set_status("RETIRED")).await.unwrap();

    let (a, b, c) = (&first.proposals[0], &second.proposals[0], &third.proposals[0]);
    assert_eq!(a.proposal.id, b.proposal.id);
    assert_eq!(b.proposal.id, c.proposal.id);
    assert!(!b.created);
    assert_eq!(b.proposal.revision, 2);
    assert_eq!(c.proposal.revision, 2);
    assert_eq!(b.proposal.changes, json!({"status": "RETIRED"}));
    assert_eq!(b.proposal.state, ProposalState::Draft);
    assert_eq!(a.instance_id, b.instance_id);
    assert_eq!(f.store.proposal_count(), 1);
    assert_eq!(f.store.instance_count(), 1);
}

#[tokio::test]
async fn revision_invalidates_earlier_approvals() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("AUTO_SUBMIT", json!([approval("status_ok", &["status"], &["u2", "u3"], 0)])),
    )
    .await;
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let instance_id = routed.proposals[0].instance_id.unwrap();

    let u2 = assignment_for(&f.store, instance_id, "u2").await;
    f.engine
        .complete_assignment(&as_user("u2"), u2.id, AssignmentDecision::Approve, None)
        .await
        .unwrap();

    let revised = f.engine.route_mutation(&as_user("u1"), &set_status("RETIRED")).await.unwrap();
    assert_eq!(revised.proposals[0].proposal.state, ProposalState::Submitted);

    let u2 = f.store.get_assignment(u2.id).await.unwrap();
    assert_eq!(u2.status, AssignmentStatus::Pending);
    assert!(u2.decided_by.is_none());
    assert_eq!(u2.metadata["proposed_hash"], json!(revised.proposals[0].proposal.proposed_hash));

    let events = f.store.list_events(instance_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::AssignmentInvalidated));
}

#[tokio::test]
async fn only_the_gated_fields_of_a_mixed_mutation_are_held() {
    let f = fixture_with(
        WorkflowRegistry::new()
            .bind("Control", "control_id")
            .with_eligible_fields("Control", ["status", "priority", "description"]),
    );
    define(
        &f.store,
        json!({
            "schemaType": "Control",
            "approvalTiming": "PRE_COMMIT",
            "approvalSubmissionMode": "AUTO_SUBMIT",
            "triggers": [{"operation": "UPDATE", "fields": ["status", "priority", "description"]}],
            "actions": [approval("gate", &["status", "priority"], &["u2"], 0)]
        }),
    )
    .await;

    let mutation = RecordedMutation::new("UPDATE", "Control", "c1")
        .set("status", json!("approved"))
        .set("description", json!("update"))
        .by("u1");
    let routed = f.engine.route_mutation(&as_user("u1"), &mutation).await.unwrap();

    assert_eq!(routed.held_fields, vec!["status".to_string()]);
    assert_eq!(routed.proposals.len(), 1);
    let proposal = &routed.proposals[0].proposal;
    assert_eq!(proposal.domain_key, "Control:priority,status");
    assert_eq!(proposal.changes, json!({"status": "approved"}));
    assert_eq!(proposal.state, ProposalState::Submitted);

    let instance = f.store.get_instance(routed.proposals[0].instance_id.unwrap()).await.unwrap();
    assert_eq!(instance.domain_key.as_deref(), Some("Control:priority,status"));
    assert_eq!(instance.context["triggerProposedChanges"], json!({"status": "approved"}));
}

#[tokio::test]
async fn each_approval_domain_gets_its_own_proposal() {
    let f = fixture();
    define(
        &f.store,
        pre_commit(
            "AUTO_SUBMIT",
            json!([
                approval("status_ok", &["status"], &["u2"], 0),
                approval("owner_ok", &["owner"], &["u3"], 0)
            ]),
        ),
    )
    .await;

    let mutation = RecordedMutation::new("UPDATE", "Control", "c1")
        .set("status", json!("ACTIVE"))
        .set("owner", json!("u4"))
        .set("title", json!("ungated"))
        .by("u1");
    let routed = f.engine.route_mutation(&as_user("u1"), &mutation).await.unwrap();

    let mut held = routed.held_fields.clone();
    held.sort();
    assert_eq!(held, vec!["owner".to_string(), "status".to_string()]);
    assert_eq!(routed.proposals.len(), 2);

    for routed in &routed.proposals {
        let assignments = f.store.list_assignments(routed.instance_id.unwrap()).await.unwrap();
        assert_eq!(assignments.len(), 1);
        let expected = if routed.proposal.domain_key == "Control:status" { "status_ok" } else { "owner_ok" };
        assert_eq!(assignments[0].action_key, expected);
    }
}

// ---------------------------------------------------------------------------
// Proposal lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn superseded_proposal_fails_its_instance() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("MANUAL_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let proposal_id = routed.proposals[0].proposal.id;

    // Drafts cannot be superseded.
    let err = f.engine.supersede_proposal(&as_user("u1"), proposal_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidProposalTransition { .. }));

    f.engine.submit_proposal(&as_user("u1"), proposal_id).await.unwrap();
    let superseded = f.engine.supersede_proposal(&as_user("u1"), proposal_id).await.unwrap();
    assert_eq!(superseded.state, ProposalState::Superseded);

    let instance = f.store.get_instance(routed.proposals[0].instance_id.unwrap()).await.unwrap();
    assert_eq!(instance.state, InstanceState::Failed);

    let err = f.engine.reject_proposal(&as_user("u1"), proposal_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidProposalTransition { from: ProposalState::Superseded, to: ProposalState::Rejected }
    ));
}

#[tokio::test]
async fn proposal_of_a_finished_instance_is_replaced() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("AUTO_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;
    let first = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let stale = &first.proposals[0];
    f.store
        .update_instance_state(stale.instance_id.unwrap(), InstanceState::Completed)
        .await
        .unwrap();

    let second = f.engine.route_mutation(&as_user("u1"), &set_status("RETIRED")).await.unwrap();
    let fresh = &second.proposals[0];
    assert!(fresh.created);
    assert_ne!(fresh.proposal.id, stale.proposal.id);
    assert_ne!(fresh.instance_id, stale.instance_id);
    assert_eq!(fresh.proposal.changes, json!({"status": "RETIRED"}));

    let retired = f.store.get_proposal(stale.proposal.id).await.unwrap();
    assert_eq!(retired.state, ProposalState::Superseded);
    assert_eq!(f.store.proposal_count(), 2);
}

#[tokio::test]
async fn proposals_of_other_organizations_are_not_found() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("MANUAL_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();

    let err = f
        .engine
        .submit_proposal(&Caller::new("other-org", "u1"), routed.proposals[0].proposal.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Database(db::DbError::NotFound)));
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconciler_replays_events_the_runtime_rejected() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("MANUAL_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;

    f.runtime.set_unavailable(true);
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let instance_id = routed.proposals[0].instance_id.unwrap();
    assert!(f.runtime.delivered().is_empty());

    f.runtime.set_unavailable(false);
    let reconciler = Reconciler::new(f.store.clone(), Some(f.runtime.clone()), ReconcilerConfig::default());
    let report = reconciler.reconcile_once().await.unwrap();

    // WORKFLOW_TRIGGERED and INSTANCE_PAUSED were both rejected.
    assert_eq!(report.recovered, 2);
    assert_eq!(f.runtime.delivered().len(), 2);
    let events = f.store.list_events(instance_id).await.unwrap();
    assert_eq!(events.iter().filter(|e| e.event_type == EventType::EmitRecovered).count(), 2);
    assert!(events.iter().all(|e| e.event_type != EventType::EmitFailed));
}

#[tokio::test]
async fn exhausted_emit_failure_releases_the_proposal_slot() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("AUTO_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;

    f.runtime.set_unavailable(true);
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let original = &routed.proposals[0];
    let instance_id = original.instance_id.unwrap();

    let config = ReconcilerConfig {
        max_attempts: 1,
        ..Default::default()
    };
    let reconciler = Reconciler::new(f.store.clone(), Some(f.runtime.clone()), config);
    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.terminal, report.scanned);
    assert!(report.terminal > 0);

    assert_eq!(f.store.get_instance(instance_id).await.unwrap().state, InstanceState::Failed);
    let closed = f.store.get_proposal(original.proposal.id).await.unwrap();
    assert_eq!(closed.state, ProposalState::Rejected);
    let events = f.store.list_events(instance_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::InstanceCompleted));

    f.runtime.set_unavailable(false);
    let rerouted = f.engine.route_mutation(&as_user("u1"), &set_status("RETIRED")).await.unwrap();
    assert!(rerouted.is_gated());
    let fresh = &rerouted.proposals[0];
    assert!(fresh.created);
    assert_ne!(fresh.proposal.id, original.proposal.id);
    assert_eq!(fresh.proposal.state, ProposalState::Submitted);
}

#[tokio::test]
async fn failed_instance_rejects_its_draft() {
    let f = fixture();
    define(
        &f.store,
        pre_commit("MANUAL_SUBMIT", json!([approval("status_ok", &["status"], &["u2"], 0)])),
    )
    .await;

    f.runtime.set_unavailable(true);
    let routed = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    let draft = &routed.proposals[0];
    assert_eq!(draft.proposal.state, ProposalState::Draft);

    let config = ReconcilerConfig {
        max_attempts: 1,
        ..Default::default()
    };
    Reconciler::new(f.store.clone(), Some(f.runtime.clone()), config)
        .reconcile_once()
        .await
        .unwrap();

    assert_eq!(
        f.store.get_instance(draft.instance_id.unwrap()).await.unwrap().state,
        InstanceState::Failed
    );
    assert_eq!(f.store.get_proposal(draft.proposal.id).await.unwrap().state, ProposalState::Rejected);

    f.runtime.set_unavailable(false);
    let rerouted = f.engine.route_mutation(&as_user("u1"), &set_status("ACTIVE")).await.unwrap();
    assert!(rerouted.proposals[0].created);
    assert_eq!(rerouted.proposals[0].proposal.state, ProposalState::Draft);
}
