//! Garbage collection of instances whose definition is gone.

use uuid::Uuid;

use db::store::DeletedCounts;
use db::{with_tx, WorkflowStore, WorkflowTx};

use crate::metrics;
use crate::observability::{Observer, Origin, OP_CLEANUP};
use crate::EngineError;

/// Instances whose definition is missing or soft-deleted.
pub async fn find_orphan_workflow_instance_ids<S: WorkflowStore + ?Sized>(
    store: &S,
    owner_id: Option<&str>,
) -> Result<Vec<Uuid>, EngineError> {
    Ok(store.find_orphan_instance_ids(owner_id).await?)
}

/// Delete everything hanging off `instance_ids`, children first.
pub async fn delete_workflow_instance_children<T: WorkflowTx>(
    tx: &mut T,
    instance_ids: &[Uuid],
) -> Result<DeletedCounts, EngineError> {
    let mut counts = DeletedCounts::default();
    if instance_ids.is_empty() {
        return Ok(counts);
    }

    // Collected before object refs go, since they link proposals.
    let proposal_ids = tx.proposal_ids_for_instances(instance_ids).await?;

    counts.assignment_targets = tx.delete_assignment_targets(instance_ids).await?;
    counts.assignments = tx.delete_assignments(instance_ids).await?;
    counts.proposals = tx.delete_proposals(&proposal_ids).await?;
    counts.object_refs = tx.delete_object_refs(instance_ids).await?;
    counts.events = tx.delete_events(instance_ids).await?;
    Ok(counts)
}

/// Find orphans and delete them with their children in one transaction.
/// Returns the deleted instance IDs.
pub async fn cleanup_orphan_workflow_instances<S: WorkflowStore + ?Sized>(
    store: &S,
    owner_id: Option<&str>,
) -> Result<Vec<Uuid>, EngineError> {
    let observer = Observer::new(Origin::Cleanup);
    let scope = observer
        .scope(OP_CLEANUP, "orphans")
        .field("owner_id", owner_id.unwrap_or("*"));

    let ids = match find_orphan_workflow_instance_ids(store, owner_id).await {
        Ok(ids) => ids,
        Err(e) => return Err(scope.fail(e)),
    };
    if ids.is_empty() {
        scope.skip("no orphaned instances");
        return Ok(ids);
    }

    let owned = ids.clone();
    let result: Result<DeletedCounts, EngineError> = with_tx(store, move |tx| {
        Box::pin(async move {
            let mut counts = delete_workflow_instance_children(tx, &owned).await?;
            counts.instances = tx.delete_instances(&owned).await?;
            Ok(counts)
        })
    })
    .await;

    match result {
        Ok(counts) => {
            metrics::record_cleanup(counts.instances);
            scope
                .field("instances", counts.instances)
                .field("proposals", counts.proposals)
                .field("events", counts.events)
                .end();
            Ok(ids)
        }
        Err(e) => Err(scope.fail(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::*;
    use db::{FailPoint, MemoryStore};
    use serde_json::json;

    async fn definition(store: &MemoryStore) -> Uuid {
        store
            .create_definition(NewWorkflowDefinition {
                owner_id: "org".into(),
                name: "d".into(),
                schema_type: "Control".into(),
                active: true,
                cooldown_seconds: 0,
                definition: json!({}),
            })
            .await
            .unwrap()
            .id
    }

    async fn instance_with_children(store: &MemoryStore, definition_id: Uuid, owner: &str) -> Uuid {
        let owner_id = owner.to_string();
        let (instance_id, _) = with_tx::<_, _, EngineError, _>(store, move |tx| {
            Box::pin(async move {
                let inst = tx
                    .create_instance(NewWorkflowInstance {
                        workflow_definition_id: definition_id,
                        owner_id: owner_id.clone(),
                        state: InstanceState::Paused,
                        object_type: "Control".into(),
                        object_id: "c1".into(),
                        domain_key: Some("Control:status".into()),
                        context: json!({}),
                        definition_snapshot: json!({}),
                    })
                    .await?;
                let obj_ref = tx
                    .create_object_ref(NewWorkflowObjectRef {
                        workflow_instance_id: inst.id,
                        owner_id: owner_id.clone(),
                        column: "control_id".into(),
                        object_id: "c1".into(),
                    })
                    .await?;
                let proposal = tx
                    .create_proposal(NewWorkflowProposal {
                        workflow_object_ref_id: obj_ref.id,
                        owner_id: owner_id.clone(),
                        object_type: "Control".into(),
                        object_id: "c1".into(),
                        domain_key: format!("Control:status:{}", inst.id),
                        state: ProposalState::Draft,
                        changes: json!({"status": "x"}),
                        proposed_hash: "h".into(),
                        submitted_by: None,
                    })
                    .await?;
                tx.set_instance_proposal(inst.id, proposal.id).await?;
                Ok((inst.id, proposal.id))
            })
        })
        .await
        .unwrap();

        let assignment = store
            .create_assignment(NewWorkflowAssignment {
                workflow_instance_id: instance_id,
                owner_id: owner.into(),
                assignment_key: "approval_a_u1".into(),
                action_key: "a".into(),
                required: true,
                label: None,
                metadata: json!({}),
            })
            .await
            .unwrap();
        store
            .create_assignment_target(NewWorkflowAssignmentTarget {
                workflow_assignment_id: assignment.id,
                owner_id: owner.into(),
                target_type: "USER".into(),
                target_user_id: "u1".into(),
                resolver_key: None,
            })
            .await
            .unwrap();
        store
            .create_event(NewWorkflowEvent {
                workflow_instance_id: instance_id,
                owner_id: owner.into(),
                event_type: EventType::WorkflowTriggered,
                payload: json!({}),
            })
            .await
            .unwrap();
        instance_id
    }

    #[tokio::test]
    async fn deletes_orphans_and_children_only() {
        let store = MemoryStore::new();
        let live = definition(&store).await;
        let dead = definition(&store).await;
        let kept = instance_with_children(&store, live, "org").await;
        let orphan = instance_with_children(&store, dead, "org").await;
        store.soft_delete_definition(dead).await.unwrap();

        let deleted = cleanup_orphan_workflow_instances(&store, None).await.unwrap();

        assert_eq!(deleted, vec![orphan]);
        assert_eq!(store.instance_count(), 1);
        assert_eq!(store.object_ref_count(), 1);
        assert_eq!(store.proposal_count(), 1);
        assert!(store.list_assignments(orphan).await.unwrap().is_empty());
        assert!(store.list_events(orphan).await.unwrap().is_empty());
        assert_eq!(store.list_events(kept).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn owner_scope_limits_cleanup() {
        let store = MemoryStore::new();
        let gone = Uuid::new_v4();
        instance_with_children(&store, gone, "org-a").await;
        let b = instance_with_children(&store, gone, "org-b").await;

        let deleted = cleanup_orphan_workflow_instances(&store, Some("org-b")).await.unwrap();
        assert_eq!(deleted, vec![b]);
        assert_eq!(store.instance_count(), 1);
    }

    #[tokio::test]
    async fn failed_commit_keeps_everything() {
        let store = MemoryStore::new();
        let orphan = instance_with_children(&store, Uuid::new_v4(), "org").await;
        store.inject_failure(FailPoint::Commit);

        let err = cleanup_orphan_workflow_instances(&store, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Transaction(_)));
        store.clear_failures();
        assert_eq!(store.instance_count(), 1);
        assert_eq!(store.list_events(orphan).await.unwrap().len(), 1);
    }
}
