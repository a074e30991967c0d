//! `MockAction`: a test double for `ActionExecutor`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ActionError, ActionExecutor, ActionRequest};

/// Behaviour injected into `MockAction` at construction time.
pub enum MockBehaviour {
    ReturnValue(Value),
    FailRetryable(String),
    FailFatal(String),
    /// Fail with `Retryable` for the first `n` calls, then succeed.
    FlakyThenOk(usize),
}

/// Records every request it receives and returns a scripted result.
pub struct MockAction {
    pub name: String,
    pub behaviour: MockBehaviour,
    pub calls: Arc<Mutex<Vec<ActionRequest>>>,
    attempts: AtomicUsize,
}

impl MockAction {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn flaky(name: impl Into<String>, failures: usize) -> Self {
        Self::with(name, MockBehaviour::FlakyThenOk(failures))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn last_request(&self) -> Option<ActionRequest> {
        self.calls.lock().ok().and_then(|c| c.last().cloned())
    }
}

#[async_trait]
impl ActionExecutor for MockAction {
    async fn execute(&self, request: &ActionRequest) -> Result<Value, ActionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(action = %self.name, action_key = %request.action_key, attempt, "mock action invoked");

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                let mut out = json!({ "action": self.name, "action_key": request.action_key });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(out)
            }
            MockBehaviour::FailRetryable(msg) => Err(ActionError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ActionError::Fatal(msg.clone())),
            MockBehaviour::FlakyThenOk(failures) if attempt < *failures => {
                Err(ActionError::Retryable(format!("attempt {} failed", attempt + 1)))
            }
            MockBehaviour::FlakyThenOk(_) => Ok(json!({ "action": self.name, "attempts": attempt + 1 })),
        }
    }
}
