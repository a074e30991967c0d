//! Replays events the runtime rejected.
//!
//! Each pass claims a batch of `EMIT_FAILED` events under a lease, re-emits
//! them with their original event ID as idempotency key, and moves each to
//! `EMIT_RECOVERED`, back to `EMIT_FAILED` with one more attempt, or to
//! `EMIT_FAILED_TERMINAL`. A terminal record fails its instance and rejects
//! the instance's open proposal.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use db::models::{EventType, InstanceState, NewWorkflowEvent, WorkflowEventRow};
use db::WorkflowStore;
use queue::{Headers, Runtime};

use crate::config::ReconcilerConfig;
use crate::emit::{emit_workflow_event, EmitFailureDetails};
use crate::executor::fail_instance_rows;
use crate::metrics;
use crate::models::WorkflowEventPayload;
use crate::observability::{Observer, Origin, OP_RECONCILE};
use crate::EngineError;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub recovered: usize,
    pub retried: usize,
    pub terminal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Recovered,
    Retried,
    Terminal,
}

pub struct Reconciler<S: WorkflowStore> {
    store: Arc<S>,
    runtime: Option<Arc<dyn Runtime>>,
    config: ReconcilerConfig,
    observer: Observer,
}

impl<S: WorkflowStore> Reconciler<S> {
    pub fn new(store: Arc<S>, runtime: Option<Arc<dyn Runtime>>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            runtime,
            config,
            observer: Observer::new(Origin::Reconciler),
        }
    }

    /// Reconcile one batch every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.config.interval_ms, "emit reconciler started");
        let mut ticker = tokio::time::interval(self.config.interval());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "emit reconciliation pass failed");
                    }
                }
            }
        }
        info!("emit reconciler stopped");
    }

    /// Process one claimed batch.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, EngineError> {
        let scope = self.observer.scope(OP_RECONCILE, EventType::EmitFailed.as_str());
        let rows = match self
            .store
            .claim_events(EventType::EmitFailed, self.config.batch_size, self.config.claim_lease())
            .await
        {
            Ok(rows) => rows,
            Err(e) => return Err(scope.fail(EngineError::from(e))),
        };

        let mut report = ReconcileReport {
            scanned: rows.len(),
            ..Default::default()
        };
        for row in rows {
            match self.reconcile_event(&row).await {
                Ok(Disposition::Recovered) => report.recovered += 1,
                Ok(Disposition::Retried) => report.retried += 1,
                Ok(Disposition::Terminal) => report.terminal += 1,
                Err(e) => {
                    // The lease lapses and a later pass picks the row up again.
                    warn!(event_id = %row.id, error = %e, "failed to reconcile emit failure");
                }
            }
        }

        metrics::record_reconciled("recovered", report.recovered as u64);
        metrics::record_reconciled("retried", report.retried as u64);
        metrics::record_reconciled("terminal", report.terminal as u64);
        scope
            .field("scanned", report.scanned)
            .field("recovered", report.recovered)
            .field("terminal", report.terminal)
            .end();
        Ok(report)
    }

    async fn reconcile_event(&self, row: &WorkflowEventRow) -> Result<Disposition, EngineError> {
        let Some(mut details) = EmitFailureDetails::from_event_payload(&row.payload) else {
            warn!(event_id = %row.id, "malformed emit failure record");
            self.mark_terminal(row, None).await?;
            return Ok(Disposition::Terminal);
        };

        if details.attempts >= self.config.max_attempts {
            self.mark_terminal(row, Some(&details)).await?;
            return Ok(Disposition::Terminal);
        }

        let headers = Headers::new(details.event_id.clone(), details.event_id.clone());
        let receipt =
            emit_workflow_event(self.runtime.as_deref(), &details.topic, &details.payload, headers).await;
        self.observer
            .record_emit(&details.topic, receipt.err.as_ref().map(|e| e as &dyn std::fmt::Display));

        details.attempts += 1;
        match receipt.err {
            None => {
                self.store
                    .update_event(row.id, EventType::EmitRecovered, details.to_event_payload(EventType::EmitRecovered))
                    .await?;
                Ok(Disposition::Recovered)
            }
            Some(err) => {
                details.last_error = err.to_string();
                if details.attempts >= self.config.max_attempts {
                    self.mark_terminal(row, Some(&details)).await?;
                    Ok(Disposition::Terminal)
                } else {
                    self.store
                        .update_event(row.id, EventType::EmitFailed, details.to_event_payload(EventType::EmitFailed))
                        .await?;
                    Ok(Disposition::Retried)
                }
            }
        }
    }

    async fn mark_terminal(&self, row: &WorkflowEventRow, details: Option<&EmitFailureDetails>) -> Result<(), EngineError> {
        let payload = match details {
            Some(d) => d.to_event_payload(EventType::EmitFailedTerminal),
            None => row.payload.clone(),
        };
        self.store
            .update_event(row.id, EventType::EmitFailedTerminal, payload)
            .await?;

        let mut instance = self.store.get_instance(row.workflow_instance_id).await?;
        if fail_instance_rows(&*self.store, &mut instance).await? {
            let reason = "emit failure exhausted retries";
            let payload = WorkflowEventPayload {
                event_type: EventType::InstanceCompleted,
                action_key: String::new(),
                details: json!({ "state": InstanceState::Failed, "reason": reason }),
            };
            self.store
                .create_event(NewWorkflowEvent {
                    workflow_instance_id: instance.id,
                    owner_id: instance.owner_id.clone(),
                    event_type: EventType::InstanceCompleted,
                    payload: serde_json::to_value(payload)?,
                })
                .await?;
            warn!(instance_id = %instance.id, event_id = %row.id, "{reason}; instance failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::LifecycleEvent;
    use crate::emit::{topics, WorkflowEmitter};
    use db::models::{NewWorkflowInstance, WorkflowInstanceRow};
    use db::MemoryStore;
    use queue::MemoryRuntime;
    use uuid::Uuid;

    fn config(max_attempts: u32) -> ReconcilerConfig {
        ReconcilerConfig {
            max_attempts,
            ..Default::default()
        }
    }

    fn seed_instance(store: &MemoryStore, state: InstanceState) -> WorkflowInstanceRow {
        let row = NewWorkflowInstance {
            workflow_definition_id: Uuid::new_v4(),
            owner_id: "org".into(),
            state,
            object_type: "Control".into(),
            object_id: "c1".into(),
            domain_key: None,
            context: json!({}),
            definition_snapshot: json!({}),
        }
        .into_row();
        store.seed_instance(row.clone());
        row
    }

    async fn seed_failure(store: &MemoryStore, instance: &WorkflowInstanceRow, attempts: u32) -> Uuid {
        let event = LifecycleEvent::new(EventType::ActionStarted, topics::ACTION_STARTED, instance);
        let mut details = EmitFailureDetails::first_failure(
            &event,
            instance,
            "evt-1",
            &crate::emit::EmitError::NoEmitter,
        );
        details.attempts = attempts;
        store
            .create_event(NewWorkflowEvent {
                workflow_instance_id: instance.id,
                owner_id: "org".into(),
                event_type: EventType::EmitFailed,
                payload: details.to_event_payload(EventType::EmitFailed),
            })
            .await
            .unwrap()
            .id
    }

    async fn event(store: &MemoryStore, instance: Uuid, id: Uuid) -> WorkflowEventRow {
        store
            .list_events(instance)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.id == id)
            .unwrap()
    }

    #[tokio::test]
    async fn successful_replay_recovers() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MemoryRuntime::new());
        let inst = seed_instance(&store, InstanceState::Running);
        let id = seed_failure(&store, &inst, 1).await;

        let reconciler = Reconciler::new(store.clone(), Some(runtime.clone()), config(3));
        let report = reconciler.reconcile_once().await.unwrap();

        assert_eq!(report, ReconcileReport { scanned: 1, recovered: 1, retried: 0, terminal: 0 });
        assert_eq!(event(&store, inst.id, id).await.event_type, EventType::EmitRecovered);
        let delivered = runtime.delivered();
        assert_eq!(delivered[0].headers.event_id, "evt-1");
        assert_eq!(delivered[0].headers.idempotency_key, "evt-1");
    }

    #[tokio::test]
    async fn failure_below_cap_increments_attempts() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.set_unavailable(true);
        let inst = seed_instance(&store, InstanceState::Running);
        let id = seed_failure(&store, &inst, 1).await;

        let reconciler = Reconciler::new(store.clone(), Some(runtime), config(3));
        let report = reconciler.reconcile_once().await.unwrap();

        assert_eq!(report.retried, 1);
        let row = event(&store, inst.id, id).await;
        assert_eq!(row.event_type, EventType::EmitFailed);
        let details = EmitFailureDetails::from_event_payload(&row.payload).unwrap();
        assert_eq!(details.attempts, 2);
        assert!(details.last_error.contains("unavailable"));
        assert_eq!(store.get_instance(inst.id).await.unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn failure_at_last_attempt_fails_instance() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.set_unavailable(true);
        let inst = seed_instance(&store, InstanceState::Paused);
        let id = seed_failure(&store, &inst, 2).await;

        let reconciler = Reconciler::new(store.clone(), Some(runtime), config(3));
        let report = reconciler.reconcile_once().await.unwrap();

        assert_eq!(report.terminal, 1);
        assert_eq!(event(&store, inst.id, id).await.event_type, EventType::EmitFailedTerminal);
        assert_eq!(store.get_instance(inst.id).await.unwrap().state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn exhausted_or_malformed_records_go_terminal_without_replay() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MemoryRuntime::new());
        let inst = seed_instance(&store, InstanceState::Completed);
        seed_failure(&store, &inst, 3).await;
        store
            .create_event(NewWorkflowEvent {
                workflow_instance_id: inst.id,
                owner_id: "org".into(),
                event_type: EventType::EmitFailed,
                payload: json!({"eventType": "EMIT_FAILED", "details": "not an object"}),
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), Some(runtime.clone()), config(3));
        let report = reconciler.reconcile_once().await.unwrap();

        assert_eq!(report.terminal, 2);
        assert!(runtime.delivered().is_empty());
        // Completed instances stay completed.
        assert_eq!(store.get_instance(inst.id).await.unwrap().state, InstanceState::Completed);
    }

    #[tokio::test]
    async fn emitter_failures_are_picked_up() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MemoryRuntime::new());
        let inst = seed_instance(&store, InstanceState::Running);

        runtime.fail_next(1);
        let emitter = WorkflowEmitter::new(Some(runtime.clone()), Observer::default());
        emitter
            .publish(store.as_ref(), &inst, LifecycleEvent::new(EventType::InstanceCompleted, topics::INSTANCE_COMPLETED, &inst))
            .await;

        let reconciler = Reconciler::new(store.clone(), Some(runtime.clone()), config(3));
        assert_eq!(reconciler.reconcile_once().await.unwrap().recovered, 1);
        assert_eq!(runtime.delivered_topics(), vec![topics::INSTANCE_COMPLETED.to_string()]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store, None, config(3));
        let token = CancellationToken::new();
        token.cancel();
        reconciler.run(token).await;
    }
}
