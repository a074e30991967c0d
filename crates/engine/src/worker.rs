//! Runs queued executor actions.
//!
//! With queued dispatch the mutation path only enqueues an [`ActionJob`] on
//! `workflow.action.execute` and pauses the instance. An [`ActionWorker`]
//! claims jobs from a [`Consumer`], runs the executor with its retry
//! back-off and continues the instance from the next action.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use actions::ActionRequest;
use db::WorkflowStore;
use queue::{Consumer, Delivery};

use crate::config::WorkerConfig;
use crate::emit::topics;
use crate::executor::WorkflowEngine;
use crate::EngineError;

/// Payload of a `workflow.action.execute` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionJob {
    pub instance_id: Uuid,
    pub action_key: String,
    pub action_index: usize,
    pub request: ActionRequest,
}

/// How a claimed job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The action ran and the instance moved on.
    Executed,
    /// The action failed and its instance was failed.
    Failed,
    /// The instance had already moved past the action.
    Stale,
    /// The payload was not an action job; dropped.
    Malformed,
    /// Handed back to the runtime for redelivery.
    Requeued,
}

pub struct ActionWorker<S: WorkflowStore> {
    engine: Arc<WorkflowEngine<S>>,
    consumer: Arc<dyn Consumer>,
    config: WorkerConfig,
}

impl<S: WorkflowStore> ActionWorker<S> {
    pub fn new(engine: Arc<WorkflowEngine<S>>, consumer: Arc<dyn Consumer>, config: WorkerConfig) -> Self {
        Self { engine, consumer, config }
    }

    /// Drain the queue, then poll every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(poll_interval_ms = self.config.poll_interval_ms, "action worker started");
        while !shutdown.is_cancelled() {
            let processed = match self.drain().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "action queue poll failed");
                    0
                }
            };
            if processed >= self.config.batch_size.max(1) {
                continue;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("action worker stopped");
    }

    /// Settle up to `batch_size` jobs; returns how many were claimed.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let mut processed = 0;
        while processed < self.config.batch_size.max(1) {
            if self.process_next().await?.is_none() {
                break;
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Claim and settle one job, if one is pending.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, EngineError> {
        let Some(delivery) = self.consumer.claim(topics::ACTION_EXECUTE).await? else {
            return Ok(None);
        };
        match self.handle(&delivery).await {
            Ok(outcome) => {
                self.consumer.ack(&delivery.id).await?;
                Ok(Some(outcome))
            }
            Err(error) => {
                self.consumer.nack(&delivery.id, &error).await?;
                Ok(Some(JobOutcome::Requeued))
            }
        }
    }

    /// `Err` carries the reason to redeliver.
    async fn handle(&self, delivery: &Delivery) -> Result<JobOutcome, String> {
        let job: ActionJob = match serde_json::from_value(delivery.envelope.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                warn!(delivery_id = %delivery.id, error = %e, "malformed action job dropped");
                return Ok(JobOutcome::Malformed);
            }
        };

        match self.engine.run_queued_action(&job).await {
            Ok(Some(instance)) => {
                debug!(instance_id = %instance.id, action_key = %job.action_key, state = %instance.state, "action job executed");
                Ok(JobOutcome::Executed)
            }
            Ok(None) => Ok(JobOutcome::Stale),
            Err(e) => match self.engine.store().get_instance(job.instance_id).await {
                // Action failures have already failed the instance.
                Ok(instance) if instance.state.is_terminal() => Ok(JobOutcome::Failed),
                _ => {
                    warn!(
                        delivery_id = %delivery.id,
                        attempts = delivery.attempts,
                        instance_id = %job.instance_id,
                        error = %e,
                        "action job requeued"
                    );
                    Err(e.to_string())
                }
            },
        }
    }
}
