//! Structured logging and metrics around engine operations.
//!
//! Open a [`Scope`] at the top of an operation; it records its outcome and
//! duration exactly once, when ended or dropped.

use std::fmt::Display;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::metrics;

pub const OP_HANDLE_MUTATION: &str = "handle_mutation";
pub const OP_ROUTE_MUTATION: &str = "route_mutation";
pub const OP_TRIGGER_WORKFLOW: &str = "trigger_workflow";
pub const OP_EXECUTE_ACTION: &str = "execute_action";
pub const OP_COMPLETE_ASSIGNMENT: &str = "complete_assignment";
pub const OP_PROPOSAL: &str = "proposal";
pub const OP_RECONCILE: &str = "reconcile";
pub const OP_CLEANUP: &str = "cleanup";

/// Where an operation was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Engine,
    Listener,
    Reconciler,
    Cleanup,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Listener => "listener",
            Self::Reconciler => "reconciler",
            Self::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// Opens scopes and emits one-shot warnings for one origin.
#[derive(Debug, Clone, Copy)]
pub struct Observer {
    origin: Origin,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new(Origin::Engine)
    }
}

impl Observer {
    pub fn new(origin: Origin) -> Self {
        metrics::init_metrics();
        Self { origin }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Begin an operation. `trigger` is the event or action type driving it.
    pub fn scope(&self, operation: &'static str, trigger: &str) -> Scope {
        Scope {
            operation,
            origin: self.origin,
            trigger: trigger.to_string(),
            fields: Vec::new(),
            start: Instant::now(),
            error: None,
            skip_reason: None,
            recorded: false,
        }
    }

    pub fn warn_engine(&self, operation: &str, trigger: &str, fields: &[(&str, &str)], err: Option<&dyn Display>) {
        warn_with(Origin::Engine, operation, trigger, fields, err);
    }

    pub fn warn_listener(&self, operation: &str, trigger: &str, fields: &[(&str, &str)], err: Option<&dyn Display>) {
        warn_with(Origin::Listener, operation, trigger, fields, err);
    }

    /// Count an emission attempt and log failures.
    pub fn record_emit(&self, topic: &str, err: Option<&dyn Display>) {
        metrics::record_emit(topic, self.origin.as_str(), err.is_none());
        if let Some(e) = err {
            warn!(origin = self.origin.as_str(), topic, error = %e, "workflow event emission failed");
        }
    }
}

fn warn_with(origin: Origin, operation: &str, trigger: &str, fields: &[(&str, &str)], err: Option<&dyn Display>) {
    let fields = render_fields(fields);
    match err {
        Some(e) => warn!(origin = origin.as_str(), operation, trigger, fields = %fields, error = %e, "workflow warning"),
        None => warn!(origin = origin.as_str(), operation, trigger, fields = %fields, "workflow warning"),
    }
}

fn render_fields(fields: &[(impl AsRef<str>, impl AsRef<str>)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One in-flight operation.
#[must_use = "a scope records when it is ended or dropped"]
pub struct Scope {
    operation: &'static str,
    origin: Origin,
    trigger: String,
    fields: Vec<(&'static str, String)>,
    start: Instant,
    error: Option<String>,
    skip_reason: Option<String>,
    recorded: bool,
}

impl Scope {
    pub fn field(mut self, key: &'static str, value: impl Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn add_field(&mut self, key: &'static str, value: impl Display) {
        self.fields.push((key, value.to_string()));
    }

    /// Remember `err` as the failure cause; the first one wins.
    pub fn record_error(&mut self, err: &dyn Display) {
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    /// Record `err`, end the scope and hand the error back.
    pub fn fail<E: Display>(mut self, err: E) -> E {
        self.record_error(&err);
        self.finish();
        err
    }

    pub fn skip(mut self, reason: &str) {
        self.skip_reason = Some(reason.to_string());
        self.finish();
    }

    pub fn end(mut self) {
        self.finish();
    }

    pub fn outcome(&self) -> Outcome {
        if self.error.is_some() {
            Outcome::Failure
        } else if self.skip_reason.is_some() {
            Outcome::Skipped
        } else {
            Outcome::Success
        }
    }

    fn finish(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;

        let elapsed = self.start.elapsed();
        let outcome = self.outcome();
        metrics::record_operation(self.operation, self.origin.as_str(), &self.trigger, outcome.as_str(), elapsed);

        let fields = render_fields(self.fields.as_slice());
        let origin = self.origin.as_str();
        let ms = elapsed.as_millis() as u64;
        match outcome {
            Outcome::Success => info!(operation = self.operation, origin, trigger = %self.trigger, fields = %fields, duration_ms = ms, "workflow operation completed"),
            Outcome::Skipped => debug!(
                operation = self.operation,
                origin,
                trigger = %self.trigger,
                fields = %fields,
                reason = self.skip_reason.as_deref().unwrap_or_default(),
                "workflow operation skipped"
            ),
            Outcome::Failure => warn!(
                operation = self.operation,
                origin,
                trigger = %self.trigger,
                fields = %fields,
                error = self.error.as_deref().unwrap_or_default(),
                duration_ms = ms,
                "workflow operation failed"
            ),
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OPERATIONS_TOTAL;

    fn count(op: &str, trigger: &str, outcome: &str) -> f64 {
        OPERATIONS_TOTAL
            .with_label_values(&[op, "engine", trigger, outcome])
            .get()
    }

    #[test]
    fn scope_records_once_on_drop() {
        let obs = Observer::default();
        let before = count("test_drop", "UPDATE", "success");
        {
            let _scope = obs.scope("test_drop", "UPDATE").field("object_id", "c1");
        }
        assert_eq!(count("test_drop", "UPDATE", "success"), before + 1.0);
    }

    #[test]
    fn fail_returns_error_and_records_failure() {
        let obs = Observer::default();
        let before = count("test_fail", "UPDATE", "failure");

        let err = obs.scope("test_fail", "UPDATE").fail("boom");

        assert_eq!(err, "boom");
        assert_eq!(count("test_fail", "UPDATE", "failure"), before + 1.0);
    }

    #[test]
    fn first_error_wins_and_skip_is_distinct() {
        let obs = Observer::default();
        let mut scope = obs.scope("test_first", "CREATE");
        scope.record_error(&"first");
        scope.record_error(&"second");
        assert_eq!(scope.error.as_deref(), Some("first"));
        scope.end();

        let before = count("test_skip", "CREATE", "skipped");
        obs.scope("test_skip", "CREATE").skip("no match");
        assert_eq!(count("test_skip", "CREATE", "skipped"), before + 1.0);
    }
}
