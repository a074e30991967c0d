//! Lifecycle event emission with durable failure records.
//!
//! Every event goes through [`emit_workflow_event`], which never fails the
//! caller. When the runtime rejects an event, [`WorkflowEmitter::publish`]
//! persists an `EMIT_FAILED` event holding [`EmitFailureDetails`] so the
//! [`crate::reconcile::Reconciler`] can replay it later.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use db::models::{EventType, NewWorkflowEvent, WorkflowInstanceRow};
use db::WorkflowStore;
use queue::{Headers, QueueError, Runtime};

use crate::models::WorkflowEventPayload;
use crate::observability::{Observer, OP_RECONCILE};

/// Stable topic names.
pub mod topics {
    pub const WORKFLOW_TRIGGERED: &str = "workflow.triggered";
    pub const ACTION_STARTED: &str = "workflow.action.started";
    pub const ACTION_COMPLETED: &str = "workflow.action.completed";
    pub const ACTION_FAILED: &str = "workflow.action.failed";
    pub const ACTION_SKIPPED: &str = "workflow.action.skipped";
    /// Jobs for [`crate::worker::ActionWorker`], not lifecycle notifications.
    pub const ACTION_EXECUTE: &str = "workflow.action.execute";
    pub const ASSIGNMENT_CREATED: &str = "workflow.assignment.created";
    pub const ASSIGNMENT_RESOLVED: &str = "workflow.assignment.resolved";
    pub const INSTANCE_PAUSED: &str = "workflow.instance.paused";
    pub const INSTANCE_RESUMED: &str = "workflow.instance.resumed";
    pub const INSTANCE_COMPLETED: &str = "workflow.instance.completed";
}

#[derive(Debug, Clone, Error)]
pub enum EmitError {
    #[error("no emitter configured")]
    NoEmitter,

    #[error("enqueue failed: {0}")]
    Enqueue(#[from] QueueError),

    #[error("failed to encode event payload: {0}")]
    Encode(String),
}

/// Outcome of one emission. `err` is set instead of returning `Result` so
/// callers always learn the event ID they tried to send.
#[derive(Debug, Clone)]
pub struct EmitReceipt {
    pub event_id: String,
    pub enqueued: bool,
    pub err: Option<EmitError>,
}

impl EmitReceipt {
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

/// Emit `payload` on `topic`.
///
/// A blank event ID is replaced with a fresh one and a blank idempotency key
/// defaults to the event ID. With no runtime the receipt carries
/// [`EmitError::NoEmitter`].
pub async fn emit_workflow_event<P: Serialize + ?Sized>(
    runtime: Option<&dyn Runtime>,
    topic: &str,
    payload: &P,
    mut headers: Headers,
) -> EmitReceipt {
    if headers.event_id.trim().is_empty() {
        headers.event_id = Uuid::new_v4().to_string();
    }
    if headers.idempotency_key.trim().is_empty() {
        headers.idempotency_key = headers.event_id.clone();
    }
    let event_id = headers.event_id.clone();

    let fail = |err: EmitError| EmitReceipt {
        event_id: event_id.clone(),
        enqueued: false,
        err: Some(err),
    };

    let Some(runtime) = runtime else {
        return fail(EmitError::NoEmitter);
    };
    let payload = match serde_json::to_value(payload) {
        Ok(v) => v,
        Err(e) => return fail(EmitError::Encode(e.to_string())),
    };

    match runtime.emit_with_headers(topic, payload, headers).await {
        Ok(receipt) => EmitReceipt {
            event_id: if receipt.event_id.is_empty() { event_id.clone() } else { receipt.event_id },
            enqueued: receipt.enqueued,
            err: None,
        },
        Err(e) => fail(EmitError::Enqueue(e)),
    }
}

/// Replayable record of an event the runtime did not accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitFailureDetails {
    pub topic: String,
    pub event_id: String,
    pub payload: Value,
    pub attempts: u32,
    pub last_error: String,
    pub original_event_type: String,
    #[serde(default)]
    pub action_key: String,
    /// `-1` for instance-level events.
    #[serde(default = "no_action_index")]
    pub action_index: i64,
    #[serde(default)]
    pub object_id: String,
    #[serde(default)]
    pub object_type: String,
}

fn no_action_index() -> i64 {
    -1
}

impl EmitFailureDetails {
    /// Details of a first failed attempt.
    pub fn first_failure(event: &LifecycleEvent, instance: &WorkflowInstanceRow, event_id: &str, err: &EmitError) -> Self {
        Self {
            topic: event.topic.to_string(),
            event_id: event_id.to_string(),
            payload: event.payload.clone(),
            attempts: 1,
            last_error: err.to_string(),
            original_event_type: event.event_type.to_string(),
            action_key: event.action_key.clone(),
            action_index: event.action_index.map_or(-1, |i| i as i64),
            object_id: instance.object_id.clone(),
            object_type: instance.object_type.clone(),
        }
    }

    /// Parse the details out of an `EMIT_FAILED` event payload; `None` for
    /// records that cannot be replayed.
    pub fn from_event_payload(payload: &Value) -> Option<Self> {
        let event: WorkflowEventPayload = serde_json::from_value(payload.clone()).ok()?;
        let details: Self = serde_json::from_value(event.details).ok()?;
        (!details.topic.trim().is_empty() && !details.payload.is_null()).then_some(details)
    }

    pub fn to_event_payload(&self, event_type: EventType) -> Value {
        let payload = WorkflowEventPayload {
            event_type,
            action_key: self.action_key.clone(),
            details: serde_json::to_value(self).unwrap_or(Value::Null),
        };
        serde_json::to_value(payload).unwrap_or(Value::Null)
    }
}

/// A lifecycle event about one instance.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub event_type: EventType,
    pub topic: &'static str,
    pub action_key: String,
    pub action_index: Option<usize>,
    pub payload: Value,
}

impl LifecycleEvent {
    pub fn new(event_type: EventType, topic: &'static str, instance: &WorkflowInstanceRow) -> Self {
        Self {
            event_type,
            topic,
            action_key: String::new(),
            action_index: None,
            payload: json!({
                "instanceId": instance.id,
                "definitionId": instance.workflow_definition_id,
                "ownerId": instance.owner_id,
                "objectType": instance.object_type,
                "objectId": instance.object_id,
            }),
        }
    }

    pub fn action(mut self, key: &str, index: usize) -> Self {
        self.action_key = key.to_string();
        self.action_index = Some(index);
        self.with("actionKey", json!(key)).with("actionIndex", json!(index))
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.payload {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// Emits lifecycle events and records the ones the runtime rejects.
#[derive(Clone)]
pub struct WorkflowEmitter {
    runtime: Option<Arc<dyn Runtime>>,
    observer: Observer,
}

impl WorkflowEmitter {
    pub fn new(runtime: Option<Arc<dyn Runtime>>, observer: Observer) -> Self {
        Self { runtime, observer }
    }

    pub fn runtime(&self) -> Option<&dyn Runtime> {
        self.runtime.as_deref()
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Emit `event`; on failure persist an `EMIT_FAILED` record.
    pub async fn publish<S: WorkflowStore + ?Sized>(
        &self,
        store: &S,
        instance: &WorkflowInstanceRow,
        event: LifecycleEvent,
    ) -> EmitReceipt {
        let receipt = emit_workflow_event(self.runtime(), event.topic, &event.payload, Headers::default()).await;

        let Some(err) = &receipt.err else {
            self.observer.record_emit(event.topic, None);
            return receipt;
        };
        self.observer.record_emit(event.topic, Some(err));

        let details = EmitFailureDetails::first_failure(&event, instance, &receipt.event_id, err);
        let record = NewWorkflowEvent {
            workflow_instance_id: instance.id,
            owner_id: instance.owner_id.clone(),
            event_type: EventType::EmitFailed,
            payload: details.to_event_payload(EventType::EmitFailed),
        };
        if let Err(db_err) = store.create_event(record).await {
            let instance_id = instance.id.to_string();
            self.observer.warn_engine(
                OP_RECONCILE,
                event.topic,
                &[("instance_id", instance_id.as_str()), ("event_id", receipt.event_id.as_str())],
                Some(&db_err),
            );
        }
        receipt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::{InstanceState, NewWorkflowInstance};
    use db::MemoryStore;
    use queue::MemoryRuntime;

    fn instance() -> WorkflowInstanceRow {
        NewWorkflowInstance {
            workflow_definition_id: Uuid::new_v4(),
            owner_id: "org".into(),
            state: InstanceState::Running,
            object_type: "Control".into(),
            object_id: "c1".into(),
            domain_key: None,
            context: json!({}),
            definition_snapshot: json!({}),
        }
        .into_row()
    }

    #[tokio::test]
    async fn missing_runtime_reports_no_emitter() {
        let receipt = emit_workflow_event(None, topics::ACTION_STARTED, &json!({"a": 1}), Headers::default()).await;
        assert!(matches!(receipt.err, Some(EmitError::NoEmitter)));
        assert!(!receipt.event_id.is_empty());
        assert!(!receipt.enqueued);
    }

    #[tokio::test]
    async fn idempotency_key_defaults_to_event_id() {
        let runtime = MemoryRuntime::new();
        let receipt = emit_workflow_event(Some(&runtime), topics::ACTION_STARTED, &json!({}), Headers::default()).await;
        assert!(receipt.is_ok());

        let delivered = runtime.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].headers.idempotency_key, receipt.event_id);
    }

    #[tokio::test]
    async fn supplied_headers_are_kept() {
        let runtime = MemoryRuntime::new();
        let headers = Headers::new("evt-1", "key-1");
        let receipt = emit_workflow_event(Some(&runtime), topics::ACTION_STARTED, &json!({}), headers).await;
        assert_eq!(receipt.event_id, "evt-1");
        assert_eq!(runtime.delivered()[0].headers.idempotency_key, "key-1");
    }

    #[tokio::test]
    async fn rejected_event_is_recorded_as_emit_failed() {
        let store = MemoryStore::new();
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.fail_next(1);
        let emitter = WorkflowEmitter::new(Some(runtime.clone()), Observer::default());
        let inst = instance();

        let event = LifecycleEvent::new(EventType::ActionStarted, topics::ACTION_STARTED, &inst).action("approve", 0);
        let receipt = emitter.publish(&store, &inst, event).await;
        assert!(!receipt.is_ok());

        let events = store.list_events(inst.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::EmitFailed);

        let details = EmitFailureDetails::from_event_payload(&events[0].payload).unwrap();
        assert_eq!(details.topic, topics::ACTION_STARTED);
        assert_eq!(details.event_id, receipt.event_id);
        assert_eq!(details.attempts, 1);
        assert_eq!(details.original_event_type, "ACTION_STARTED");
        assert_eq!(details.action_key, "approve");
        assert_eq!(details.action_index, 0);
        assert_eq!(details.object_id, "c1");
    }

    #[test]
    fn details_without_topic_are_not_replayable() {
        let payload = json!({"eventType": "EMIT_FAILED", "details": {"topic": "", "eventId": "e", "payload": {}, "attempts": 1, "lastError": "x", "originalEventType": "ACTION_STARTED"}});
        assert!(EmitFailureDetails::from_event_payload(&payload).is_none());
        assert!(EmitFailureDetails::from_event_payload(&json!("garbage")).is_none());
    }
}
