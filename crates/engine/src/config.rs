//! Engine configuration.
//!
//! Every section deserializes from TOML with all fields optional:
//!
//! ```toml
//! enabled = true
//! eligibility = "fail_closed"
//!
//! [cel]
//! timeout_ms = 250
//! cost_limit = 10000
//!
//! [reconciler]
//! max_attempts = 5
//!
//! [executor]
//! dispatch = "queued"
//!
//! [worker]
//! poll_interval_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Expression environment limits and feature switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CelConfig {
    /// Wall-clock limit for one evaluation.
    pub timeout_ms: u64,
    /// Estimated-cost ceiling checked before evaluation; 0 disables it.
    pub cost_limit: u64,
    /// Block size, in elements, in which comprehension passes are charged by
    /// the pre-evaluation cost estimate.
    pub interrupt_check_frequency: u32,
    /// Ceiling on the worst-case number of comprehension iterations, taken as
    /// the largest input collection raised to the comprehension nesting
    /// depth. Checked against the actual inputs before evaluation starts;
    /// 0 disables it.
    pub comprehension_iteration_limit: u64,
    /// Compiled programs kept in the cache; the cache is cleared when full.
    pub program_cache_size: usize,
    pub parser_recursion_limit: usize,
    /// Maximum expression length in code points.
    pub parser_expression_size_limit: usize,
    /// Maximum nesting of comprehension macros; 0 is unlimited.
    pub comprehension_nesting_limit: usize,
    /// Check regex and duration/timestamp literals at compile time.
    pub extended_validations: bool,
    pub optional_types: bool,
    pub identifier_escape_syntax: bool,
    pub cross_type_numeric_comparisons: bool,
    pub macro_call_tracking: bool,
    /// Cache compiled programs by source text.
    pub eval_optimize: bool,
    /// Log activation and result of each evaluation.
    pub track_state: bool,
}

impl Default for CelConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            cost_limit: 0,
            interrupt_check_frequency: 100,
            comprehension_iteration_limit: 1_000_000,
            program_cache_size: 1024,
            parser_recursion_limit: 250,
            parser_expression_size_limit: 100_000,
            comprehension_nesting_limit: 0,
            extended_validations: true,
            optional_types: false,
            identifier_escape_syntax: false,
            cross_type_numeric_comparisons: false,
            macro_call_tracking: false,
            eval_optimize: true,
            track_state: false,
        }
    }
}

impl CelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cost_limit(mut self, limit: u64) -> Self {
        self.cost_limit = limit;
        self
    }

    pub fn with_comprehension_iteration_limit(mut self, limit: u64) -> Self {
        self.comprehension_iteration_limit = limit;
        self
    }

    pub fn with_program_cache_size(mut self, size: usize) -> Self {
        self.program_cache_size = size;
        self
    }

    pub fn with_comprehension_nesting_limit(mut self, limit: usize) -> Self {
        self.comprehension_nesting_limit = limit;
        self
    }

    pub fn with_expression_size_limit(mut self, limit: usize) -> Self {
        self.parser_expression_size_limit = limit;
        self
    }

    pub fn with_macro_call_tracking(mut self, on: bool) -> Self {
        self.macro_call_tracking = on;
        self
    }
}

/// Emit-failure reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub max_attempts: u32,
    pub batch_size: usize,
    pub interval_ms: u64,
    /// How long a claimed event stays invisible to other reconcilers.
    pub claim_lease_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            batch_size: 100,
            interval_ms: 30_000,
            claim_lease_ms: 60_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }
}

/// Where executor-backed actions run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDispatch {
    /// Enqueue a job on the runtime and pause the instance until an
    /// [`crate::worker::ActionWorker`] runs it. Falls back to inline
    /// execution when the engine has no runtime.
    #[default]
    Queued,
    /// Run the executor, retries included, on the calling task.
    Inline,
}

/// Retry policy and placement for host-provided action executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable action failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay_ms: u64,
    pub dispatch: ActionDispatch,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
            dispatch: ActionDispatch::Queued,
        }
    }
}

impl ExecutorConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Action job polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Idle wait between polls of an empty queue.
    pub poll_interval_ms: u64,
    /// Jobs taken per poll before waiting again.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 50,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What to do with changed fields of an object type that has no registered
/// eligibility set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityPolicy {
    /// Pass every changed field through (with a warning).
    #[default]
    FailOpen,
    /// Treat the type as having no eligible fields.
    FailClosed,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub enabled: bool,
    pub eligibility: EligibilityPolicy,
    pub cel: CelConfig,
    pub reconciler: ReconcilerConfig,
    pub executor: ExecutorConfig,
    pub worker: WorkerConfig,
}

impl WorkflowConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("failed to parse workflow config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_eligibility(mut self, policy: EligibilityPolicy) -> Self {
        self.eligibility = policy;
        self
    }

    pub fn with_cel(mut self, cel: CelConfig) -> Self {
        self.cel = cel;
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkflowConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.eligibility, EligibilityPolicy::FailOpen);
        assert_eq!(cfg.cel.parser_recursion_limit, 250);
        assert_eq!(cfg.cel.parser_expression_size_limit, 100_000);
        assert_eq!(cfg.cel.comprehension_nesting_limit, 0);
        assert!(cfg.cel.extended_validations);
        assert!(!cfg.cel.optional_types);
        assert!(cfg.cel.eval_optimize);
        assert_eq!(cfg.cel.timeout(), Duration::from_millis(100));
        assert_eq!(cfg.cel.comprehension_iteration_limit, 1_000_000);
        assert_eq!(cfg.cel.program_cache_size, 1024);
        assert_eq!(cfg.reconciler.max_attempts, 3);
        assert_eq!(cfg.executor.dispatch, ActionDispatch::Queued);
        assert_eq!(cfg.worker.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg = WorkflowConfig::from_toml_str(
            r#"
            enabled = true
            eligibility = "fail_closed"

            [cel]
            timeout_ms = 250

            [reconciler]
            max_attempts = 5

            [executor]
            dispatch = "inline"
            "#,
        )
        .unwrap();

        assert!(cfg.is_enabled());
        assert_eq!(cfg.eligibility, EligibilityPolicy::FailClosed);
        assert_eq!(cfg.cel.timeout_ms, 250);
        assert_eq!(cfg.cel.interrupt_check_frequency, 100);
        assert_eq!(cfg.reconciler.max_attempts, 5);
        assert_eq!(cfg.reconciler.batch_size, 100);
        assert_eq!(cfg.executor.dispatch, ActionDispatch::Inline);
        assert_eq!(cfg.executor.max_retries, 3);
    }
}
