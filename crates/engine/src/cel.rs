//! Sandboxed expression evaluation for trigger conditions and action guards.
//!
//! Expressions are CEL, compiled with `cel-interpreter` and checked against a
//! fixed variable contract per [`ExpressionScope`]. Limits from [`CelConfig`]
//! are enforced at compile time (size, nesting, syntax switches), before
//! evaluation (estimated cost, and worst-case comprehension iterations over
//! the actual inputs) and during evaluation (wall-clock timeout).
//!
//! The interpreter cannot be interrupted once started, so the timeout only
//! releases the caller; the iteration ceiling is what bounds the work a
//! timed-out evaluation can still do on the blocking pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cel_interpreter::{Context, Program, Value as CelValue};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::CelConfig;
use crate::EngineError;

/// Variables visible to trigger expressions and definition conditions.
pub const BASE_VARIABLES: [&str; 7] = [
    "object",
    "user_id",
    "changed_fields",
    "changed_edges",
    "added_ids",
    "removed_ids",
    "event_type",
];

/// Extra variables visible to action `when` guards.
pub const ACTION_VARIABLES: [&str; 3] = ["assignments", "instance", "initiator"];

const MACROS: [&str; 5] = ["all", "exists", "exists_one", "map", "filter"];

lazy_static! {
    static ref MACRO_CALL: Regex = Regex::new(r"\.(all|exists_one|exists|map|filter)\s*\(").unwrap();
    static ref MACRO_ITER_VAR: Regex =
        Regex::new(r"\.(?:all|exists_one|exists|map|filter)\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*,").unwrap();
    static ref MATCHES_LITERAL: Regex =
        Regex::new(r#"matches\(\s*(?:'([^']*)'|"([^"]*)")\s*\)"#).unwrap();
    static ref TOKEN: Regex = Regex::new(r"[A-Za-z0-9_]+|[^\sA-Za-z0-9_]").unwrap();
}

/// Which variable contract an expression is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionScope {
    Base,
    Action,
}

impl ExpressionScope {
    pub fn declares(&self, name: &str) -> bool {
        BASE_VARIABLES.contains(&name) || (*self == Self::Action && ACTION_VARIABLES.contains(&name))
    }
}

/// A checked program plus what it references.
pub struct CompiledExpression {
    pub source: String,
    pub scope: ExpressionScope,
    program: Arc<Program>,
    /// Declared variables the expression reads.
    pub variables: Vec<String>,
    /// Comprehension macros in call order; empty unless tracking is on.
    pub macros: Vec<String>,
    macro_count: usize,
    comprehension_depth: usize,
    tokens: usize,
}

impl std::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("source", &self.source)
            .field("scope", &self.scope)
            .field("variables", &self.variables)
            .field("macros", &self.macros)
            .finish()
    }
}

/// Compiles and evaluates expressions under one [`CelConfig`].
///
/// Build once and share; compiled programs are cached by source when
/// `eval_optimize` is on, up to `program_cache_size` entries.
pub struct CelEvaluator {
    config: CelConfig,
    cache: Mutex<HashMap<(ExpressionScope, String), Arc<CompiledExpression>>>,
}

impl CelEvaluator {
    pub fn new(config: CelConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CelConfig {
        &self.config
    }

    /// Compile `expression`, surfacing every problem as [`EngineError::CelCompile`].
    pub fn compile(&self, expression: &str, scope: ExpressionScope) -> Result<Arc<CompiledExpression>, EngineError> {
        let key = (scope, expression.to_string());
        if self.config.eval_optimize {
            if let Some(hit) = self.cache.lock().get(&key) {
                return Ok(Arc::clone(hit));
            }
        }

        let compiled = Arc::new(self.compile_uncached(expression, scope)?);
        let capacity = self.config.program_cache_size;
        if self.config.eval_optimize && capacity > 0 {
            let mut cache = self.cache.lock();
            if cache.len() >= capacity {
                debug!(entries = cache.len(), "expression cache full; clearing");
                cache.clear();
            }
            cache.insert(key, Arc::clone(&compiled));
        }
        Ok(compiled)
    }

    /// Number of compiled programs currently cached.
    pub fn cached_programs(&self) -> usize {
        self.cache.lock().len()
    }

    fn compile_uncached(&self, expression: &str, scope: ExpressionScope) -> Result<CompiledExpression, EngineError> {
        let fail = |message: String| EngineError::CelCompile {
            expression: expression.to_string(),
            message,
        };

        let size = expression.chars().count();
        if size > self.config.parser_expression_size_limit {
            return Err(fail(format!(
                "expression size {size} exceeds limit {}",
                self.config.parser_expression_size_limit
            )));
        }

        let shape = scan(expression);
        if shape.max_depth > self.config.parser_recursion_limit {
            return Err(fail(format!(
                "nesting depth {} exceeds recursion limit {}",
                shape.max_depth, self.config.parser_recursion_limit
            )));
        }
        let nesting_limit = self.config.comprehension_nesting_limit;
        if nesting_limit > 0 && shape.max_comprehension_depth > nesting_limit {
            return Err(fail(format!(
                "comprehension nesting {} exceeds limit {nesting_limit}",
                shape.max_comprehension_depth
            )));
        }
        if !self.config.optional_types && shape.optional_syntax {
            return Err(fail("optional syntax is not enabled".to_string()));
        }
        if !self.config.identifier_escape_syntax && shape.backtick {
            return Err(fail("escaped identifiers are not enabled".to_string()));
        }

        let program = Program::compile(expression).map_err(|e| fail(e.to_string()))?;

        if self.config.extended_validations {
            for caps in MATCHES_LITERAL.captures_iter(expression) {
                let pattern = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                Regex::new(pattern).map_err(|e| fail(format!("invalid regex '{pattern}': {e}")))?;
            }
        }

        let iter_vars: HashSet<&str> = MACRO_ITER_VAR
            .captures_iter(expression)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        let references = program.references();
        let mut variables = Vec::new();
        for name in references.variables() {
            if iter_vars.contains(name) {
                continue;
            }
            if !scope.declares(name) {
                return Err(fail(format!("undeclared reference to '{name}'")));
            }
            variables.push(name.to_string());
        }
        variables.sort();
        variables.dedup();

        let macro_calls: Vec<String> = MACRO_CALL
            .captures_iter(expression)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();

        Ok(CompiledExpression {
            source: expression.to_string(),
            scope,
            program: Arc::new(program),
            variables,
            macro_count: macro_calls.len(),
            comprehension_depth: shape.max_comprehension_depth,
            macros: if self.config.macro_call_tracking { macro_calls } else { Vec::new() },
            tokens: TOKEN.find_iter(expression).count(),
        })
    }

    /// Compile and evaluate `expression` to a boolean.
    pub async fn evaluate(
        &self,
        expression: &str,
        scope: ExpressionScope,
        vars: &Map<String, Value>,
    ) -> Result<bool, EngineError> {
        let compiled = self.compile(expression, scope)?;
        self.evaluate_compiled(&compiled, vars).await
    }

    pub async fn evaluate_compiled(
        &self,
        compiled: &CompiledExpression,
        vars: &Map<String, Value>,
    ) -> Result<bool, EngineError> {
        let iterations = worst_case_iterations(compiled, vars);
        let iteration_limit = self.config.comprehension_iteration_limit;
        if iteration_limit > 0 && iterations > iteration_limit {
            return Err(EngineError::CelIterationLimit {
                expression: compiled.source.clone(),
                iterations,
                limit: iteration_limit,
            });
        }
        let cost = self.estimate_cost(compiled, vars, iterations);
        if self.config.cost_limit > 0 && cost > self.config.cost_limit {
            return Err(EngineError::CelCostLimit {
                expression: compiled.source.clone(),
                cost,
                limit: self.config.cost_limit,
            });
        }

        // Only the referenced variables cross into the blocking task.
        let activation: Vec<(String, Value)> = compiled
            .variables
            .iter()
            .filter_map(|name| vars.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        if self.config.track_state {
            debug!(expression = %compiled.source, variables = ?compiled.variables, cost, "evaluating expression");
        }

        let program = Arc::clone(&compiled.program);
        let cross_type = self.config.cross_type_numeric_comparisons;
        let task = tokio::task::spawn_blocking(move || {
            let mut ctx = Context::default();
            for (name, value) in activation {
                ctx.add_variable_from_value(name, to_cel_value(&value, cross_type));
            }
            program.execute(&ctx).map_err(|e| e.to_string())
        });

        let timeout = self.config.timeout();
        let outcome = tokio::time::timeout(timeout, task)
            .await
            .map_err(|_| EngineError::CelTimeout {
                expression: compiled.source.clone(),
                timeout,
            })?
            .map_err(|e| EngineError::CelEvaluation {
                expression: compiled.source.clone(),
                message: e.to_string(),
            })?
            .map_err(|message| EngineError::CelEvaluation {
                expression: compiled.source.clone(),
                message,
            })?;

        if self.config.track_state {
            debug!(expression = %compiled.source, result = ?outcome, "expression evaluated");
        }

        match outcome {
            CelValue::Bool(b) => Ok(b),
            _ => Err(EngineError::CelTypeMismatch(compiled.source.clone())),
        }
    }

    /// Token count plus referenced data size, charged once per pass over the
    /// data: one for the expression and one per comprehension macro. A macro
    /// pass costs the larger of the data size and the worst-case iteration
    /// count, rounded up to whole `interrupt_check_frequency` blocks.
    fn estimate_cost(&self, compiled: &CompiledExpression, vars: &Map<String, Value>, iterations: u64) -> u64 {
        let data: u64 = compiled
            .variables
            .iter()
            .filter_map(|name| vars.get(name))
            .map(value_size)
            .sum();
        let block = u64::from(self.config.interrupt_check_frequency.max(1));
        let per_macro = data.max(iterations).div_ceil(block).saturating_mul(block);
        (compiled.tokens as u64)
            .saturating_add(data)
            .saturating_add((compiled.macro_count as u64).saturating_mul(per_macro))
    }
}

/// The largest referenced collection raised to the comprehension nesting
/// depth; 0 for expressions without comprehensions.
fn worst_case_iterations(compiled: &CompiledExpression, vars: &Map<String, Value>) -> u64 {
    if compiled.comprehension_depth == 0 {
        return 0;
    }
    let widest = compiled
        .variables
        .iter()
        .filter_map(|name| vars.get(name))
        .map(largest_collection)
        .max()
        .unwrap_or(0)
        .max(1);
    let depth = u32::try_from(compiled.comprehension_depth).unwrap_or(u32::MAX);
    widest.saturating_pow(depth)
}

fn largest_collection(value: &Value) -> u64 {
    match value {
        Value::Array(items) => items.iter().map(largest_collection).fold(items.len() as u64, u64::max),
        Value::Object(map) => map.values().map(largest_collection).fold(map.len() as u64, u64::max),
        _ => 0,
    }
}

fn value_size(value: &Value) -> u64 {
    match value {
        Value::Array(items) => 1 + items.iter().map(value_size).sum::<u64>(),
        Value::Object(map) => 1 + map.values().map(value_size).sum::<u64>(),
        _ => 1,
    }
}

/// JSON to CEL, keeping integral numbers as `int`.
pub fn to_cel_value(value: &Value, cross_type_numeric: bool) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                let f = n.as_f64().unwrap_or_default();
                if cross_type_numeric && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    CelValue::Int(f as i64)
                } else {
                    CelValue::Float(f)
                }
            }
        }
        Value::String(s) => CelValue::String(Arc::new(s.clone())),
        Value::Array(items) => CelValue::List(Arc::new(
            items.iter().map(|v| to_cel_value(v, cross_type_numeric)).collect(),
        )),
        Value::Object(map) => {
            let converted: HashMap<String, CelValue> = map
                .iter()
                .map(|(k, v)| (k.clone(), to_cel_value(v, cross_type_numeric)))
                .collect();
            CelValue::from(converted)
        }
    }
}

#[derive(Debug, Default)]
struct Shape {
    max_depth: usize,
    max_comprehension_depth: usize,
    optional_syntax: bool,
    backtick: bool,
}

/// Bracket and comprehension nesting outside string literals.
fn scan(expression: &str) -> Shape {
    let chars: Vec<char> = expression.chars().collect();
    let mut shape = Shape::default();
    // true for parens opened by a comprehension macro call
    let mut stack: Vec<bool> = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '`' => shape.backtick = true,
            '?' if chars.get(i + 1) == Some(&'.') => shape.optional_syntax = true,
            '.' if chars.get(i + 1) == Some(&'?') => shape.optional_syntax = true,
            '[' if chars.get(i + 1) == Some(&'?') => {
                shape.optional_syntax = true;
                stack.push(false);
            }
            '(' => stack.push(preceded_by_macro(&chars[..i])),
            '[' | '{' => stack.push(false),
            ')' | ']' | '}' => {
                stack.pop();
            }
            _ => {}
        }

        shape.max_depth = shape.max_depth.max(stack.len());
        let comprehension = stack.iter().filter(|m| **m).count();
        shape.max_comprehension_depth = shape.max_comprehension_depth.max(comprehension);
        i += 1;
    }

    shape
}

fn preceded_by_macro(before: &[char]) -> bool {
    let text: String = before.iter().collect();
    let trimmed = text.trim_end();
    MACROS.iter().any(|m| {
        trimmed
            .strip_suffix(m)
            .map_or(false, |rest| rest.ends_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn evaluator() -> CelEvaluator {
        CelEvaluator::new(CelConfig::default())
    }

    #[tokio::test]
    async fn evaluates_against_base_variables() {
        let ev = evaluator();
        let activation = vars(json!({
            "object": {"status": "APPROVED", "score": 7},
            "changed_fields": ["status"],
            "event_type": "UPDATE",
        }));

        assert!(ev
            .evaluate("object.status == 'APPROVED' && 'status' in changed_fields", ExpressionScope::Base, &activation)
            .await
            .unwrap());
        assert!(ev.evaluate("object.score > 5", ExpressionScope::Base, &activation).await.unwrap());
        assert!(!ev.evaluate("event_type == 'CREATE'", ExpressionScope::Base, &activation).await.unwrap());
    }

    #[tokio::test]
    async fn non_boolean_result_is_a_type_mismatch() {
        let err = evaluator()
            .evaluate("user_id", ExpressionScope::Base, &vars(json!({"user_id": "u1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CelTypeMismatch(_)));
    }

    #[test]
    fn undeclared_variables_fail_to_compile() {
        let ev = evaluator();
        let err = ev.compile("secret == 1", ExpressionScope::Base).unwrap_err();
        assert!(err.is_definition_error());

        assert!(ev.compile("initiator == 'u1'", ExpressionScope::Base).is_err());
        assert!(ev.compile("initiator == 'u1'", ExpressionScope::Action).is_ok());
    }

    #[test]
    fn comprehension_variables_are_not_references() {
        let ev = evaluator();
        let compiled = ev
            .compile("changed_fields.exists(f, f == 'status')", ExpressionScope::Base)
            .unwrap();
        assert_eq!(compiled.variables, vec!["changed_fields".to_string()]);
    }

    #[test]
    fn syntax_errors_surface() {
        assert!(matches!(
            evaluator().compile("object.status ==", ExpressionScope::Base),
            Err(EngineError::CelCompile { .. })
        ));
    }

    #[test]
    fn size_and_nesting_limits() {
        let ev = CelEvaluator::new(
            CelConfig::default()
                .with_expression_size_limit(10)
                .with_comprehension_nesting_limit(1),
        );
        assert!(ev.compile("user_id == 'abcdefghijk'", ExpressionScope::Base).is_err());

        let ev = CelEvaluator::new(CelConfig::default().with_comprehension_nesting_limit(1));
        let nested = "changed_fields.all(f, changed_edges.exists(e, e == f))";
        assert!(ev.compile(nested, ExpressionScope::Base).is_err());
        assert!(ev.compile("changed_fields.all(f, f != '')", ExpressionScope::Base).is_ok());
    }

    #[test]
    fn disabled_syntax_is_rejected() {
        let ev = evaluator();
        assert!(ev.compile("object.?status == 'x'", ExpressionScope::Base).is_err());
        assert!(ev.compile("object.`my-field` == 1", ExpressionScope::Base).is_err());
    }

    #[test]
    fn invalid_regex_literal_is_rejected() {
        let ev = evaluator();
        assert!(ev.compile("user_id.matches('[a-')", ExpressionScope::Base).is_err());
    }

    #[test]
    fn macro_tracking_records_calls() {
        let ev = CelEvaluator::new(CelConfig::default().with_macro_call_tracking(true));
        let compiled = ev
            .compile("changed_fields.exists(f, f == 'a') || changed_edges.all(e, e != '')", ExpressionScope::Base)
            .unwrap();
        assert_eq!(compiled.macros, vec!["exists".to_string(), "all".to_string()]);
    }

    #[tokio::test]
    async fn cost_limit_rejects_large_inputs() {
        let ev = CelEvaluator::new(CelConfig::default().with_cost_limit(50));
        let big: Vec<String> = (0..200).map(|i| format!("f{i}")).collect();
        let err = ev
            .evaluate(
                "changed_fields.exists(f, f == 'x')",
                ExpressionScope::Base,
                &vars(json!({"changed_fields": big})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CelCostLimit { limit: 50, .. }));
    }

    fn fields(n: usize) -> Map<String, Value> {
        let names: Vec<String> = (0..n).map(|i| format!("f{i}")).collect();
        vars(json!({"changed_fields": names}))
    }

    #[tokio::test]
    async fn nested_comprehension_over_large_input_is_refused_up_front() {
        let ev = CelEvaluator::new(CelConfig::default().with_timeout(Duration::from_millis(20)));
        let expression = "changed_fields.all(a, changed_fields.all(b, changed_fields.all(c, a != '' || b != c)))";

        let started = Instant::now();
        let err = ev.evaluate(expression, ExpressionScope::Base, &fields(400)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CelIterationLimit { iterations: 64_000_000, limit: 1_000_000, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        // Small inputs under the same expression still evaluate.
        assert!(ev.evaluate(expression, ExpressionScope::Base, &fields(3)).await.unwrap());
    }

    #[test]
    fn iterations_grow_with_nesting_and_the_widest_input() {
        let ev = evaluator();
        let activation = vars(json!({
            "changed_fields": ["a", "b", "c"],
            "object": {"tags": ["x", "y", "z", "w", "v"]},
        }));

        let flat = ev.compile("object.tags.exists(t, t == 'x')", ExpressionScope::Base).unwrap();
        assert_eq!(worst_case_iterations(&flat, &activation), 5);

        let nested = ev
            .compile("changed_fields.all(f, object.tags.exists(t, t == f))", ExpressionScope::Base)
            .unwrap();
        assert_eq!(worst_case_iterations(&nested, &activation), 25);

        let plain = ev.compile("'a' in changed_fields", ExpressionScope::Base).unwrap();
        assert_eq!(worst_case_iterations(&plain, &activation), 0);
    }

    #[tokio::test]
    async fn slow_evaluation_times_out() {
        let ev = CelEvaluator::new(CelConfig::default().with_timeout(Duration::from_millis(1)));
        let err = ev
            .evaluate(
                "changed_fields.all(a, changed_fields.all(b, b != a || a != ''))",
                ExpressionScope::Base,
                &fields(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CelTimeout { timeout, .. } if timeout == Duration::from_millis(1)));
    }

    #[test]
    fn compiled_programs_are_cached() {
        let ev = evaluator();
        let a = ev.compile("user_id == 'x'", ExpressionScope::Base).unwrap();
        let b = ev.compile("user_id == 'x'", ExpressionScope::Base).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn program_cache_is_bounded() {
        let ev = CelEvaluator::new(CelConfig::default().with_program_cache_size(2));
        for id in ["a", "b", "c", "d", "e"] {
            ev.compile(&format!("user_id == '{id}'"), ExpressionScope::Base).unwrap();
            assert!(ev.cached_programs() <= 2);
        }
        let last = ev.compile("user_id == 'e'", ExpressionScope::Base).unwrap();
        let again = ev.compile("user_id == 'e'", ExpressionScope::Base).unwrap();
        assert!(Arc::ptr_eq(&last, &again));

        let uncached = CelEvaluator::new(CelConfig::default().with_program_cache_size(0));
        uncached.compile("user_id == 'x'", ExpressionScope::Base).unwrap();
        assert_eq!(uncached.cached_programs(), 0);
    }
}
