//! Execution context with step result tracking and template resolution.
//!
//! `ExecutionContext` is the mutable, versioned state of one run. Steps only
//! ever see a clone; the scheduler applies their results to the single owned
//! copy, which is then checkpointed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;
use weft_types::workflow::{RunStatus, StepMessage, StepStatus};

/// Maximum size of a single step result (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Keys of the expression scope that flattened input/variables never shadow.
const RESERVED_SCOPE_KEYS: &[&str] = &["input", "variables", "steps", "loops", "workflow"];

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Mutable execution state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub input_data: Value,
    pub variables: BTreeMap<String, Value>,
    /// Append-only log of settled step transitions.
    pub messages: Vec<StepMessage>,
    pub step_results: BTreeMap<String, Value>,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    #[serde(default)]
    pub skipped_steps: BTreeSet<String>,
    /// Steps released by their controlling Condition/Loop/Parallel.
    #[serde(default)]
    pub activated_steps: BTreeSet<String>,
    /// Loop/Parallel steps waiting on their children.
    #[serde(default)]
    pub waiting_steps: BTreeSet<String>,
    /// Loop id -> iterations entered so far.
    #[serde(default)]
    pub loop_iterations: BTreeMap<String, u32>,
    /// Guarded step id -> retries granted by its error handler.
    #[serde(default)]
    pub handler_attempts: BTreeMap<String, u32>,
    pub status: RunStatus,
    /// Snapshot recorded by the End step.
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Incremented on every applied transition.
    #[serde(default)]
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        workflow_name: impl Into<String>,
        input_data: Value,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            input_data,
            variables,
            messages: Vec::new(),
            step_results: BTreeMap::new(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
            activated_steps: BTreeSet::new(),
            waiting_steps: BTreeSet::new(),
            loop_iterations: BTreeMap::new(),
            handler_attempts: BTreeMap::new(),
            status: RunStatus::Running,
            output: None,
            error: None,
            version: 0,
            started_at: now,
            updated_at: now,
        }
    }

    // -- step status --------------------------------------------------------

    pub fn step_status(&self, step_id: &str) -> StepStatus {
        if self.completed_steps.contains(step_id) {
            StepStatus::Completed
        } else if self.failed_steps.contains(step_id) {
            StepStatus::Failed
        } else if self.skipped_steps.contains(step_id) {
            StepStatus::Skipped
        } else if self.waiting_steps.contains(step_id) {
            StepStatus::Running
        } else {
            StepStatus::Pending
        }
    }

    /// Completed or skipped.
    pub fn is_resolved(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id) || self.skipped_steps.contains(step_id)
    }

    /// Completed, failed or skipped.
    pub fn is_settled(&self, step_id: &str) -> bool {
        self.is_resolved(step_id) || self.failed_steps.contains(step_id)
    }

    pub fn mark_completed(&mut self, step_id: &str) {
        self.clear_status(step_id);
        self.completed_steps.insert(step_id.to_string());
    }

    pub fn mark_failed(&mut self, step_id: &str) {
        self.clear_status(step_id);
        self.failed_steps.insert(step_id.to_string());
    }

    pub fn mark_skipped(&mut self, step_id: &str) {
        self.clear_status(step_id);
        self.skipped_steps.insert(step_id.to_string());
    }

    pub fn mark_waiting(&mut self, step_id: &str) {
        self.clear_status(step_id);
        self.waiting_steps.insert(step_id.to_string());
    }

    fn clear_status(&mut self, step_id: &str) {
        self.completed_steps.remove(step_id);
        self.failed_steps.remove(step_id);
        self.skipped_steps.remove(step_id);
        self.waiting_steps.remove(step_id);
    }

    /// Return steps to pending and drop their results (loop re-entry, retry).
    pub fn reset_steps<'a>(&mut self, step_ids: impl IntoIterator<Item = &'a String>) {
        for id in step_ids {
            self.clear_status(id);
            self.step_results.remove(id);
        }
    }

    pub fn push_message(&mut self, message: StepMessage) {
        self.messages.push(message);
    }

    /// Bump the version after an applied transition.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    // -- results ------------------------------------------------------------

    /// Store a step result.
    ///
    /// Results over `MAX_STEP_OUTPUT_SIZE` are replaced by a truncation
    /// marker. Exceeding `MAX_CONTEXT_SIZE` in total is an error.
    pub fn set_step_result(&mut self, step_id: &str, result: Value) -> Result<(), ContextError> {
        let size = serialized_len(&result)?;
        if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step result exceeds size limit, truncating"
            );
            self.step_results
                .insert(step_id.to_string(), truncation_marker(size));
        } else {
            self.step_results.insert(step_id.to_string(), result);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.step_results.get(step_id)
    }

    /// Total serialized size of results, variables and input, in bytes.
    pub fn total_size(&self) -> usize {
        let size = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        self.step_results.values().map(size).sum::<usize>()
            + self.variables.values().map(size).sum::<usize>()
            + size(&self.input_data)
    }

    // -- templates ----------------------------------------------------------

    /// Resolve `{{ path }}` placeholders in a string.
    ///
    /// Supported roots: `input.<field>`, `variables.<name>`,
    /// `steps.<id>.output`, `steps.<id>.status` and `loops.<id>.iteration`;
    /// further segments index into the value. Unknown references are left
    /// verbatim.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            let Some(close) = rest[open + 2..].find("}}") else {
                break;
            };
            let close = open + 2 + close;
            result.push_str(&rest[..open]);

            let path = rest[open + 2..close].trim();
            match self.lookup(path) {
                Some(value) => result.push_str(&value_to_string(&value)),
                None => result.push_str(&rest[open..close + 2]),
            }
            rest = &rest[close + 2..];
        }
        result.push_str(rest);
        result
    }

    /// Resolve templates recursively through any JSON shape.
    ///
    /// A string that is exactly one placeholder is replaced by the raw value
    /// it references, so objects and numbers keep their type.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(path) = single_placeholder(s) {
                    if let Some(resolved) = self.lookup(path) {
                        return resolved;
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;
        let (base, rest): (Value, Vec<&str>) = match root {
            "input" => (self.input_data.clone(), segments.collect()),
            "variables" => {
                let name = segments.next()?;
                (self.variables.get(name)?.clone(), segments.collect())
            }
            "steps" => {
                let id = segments.next()?;
                match segments.next()? {
                    "output" => (self.step_results.get(id)?.clone(), segments.collect()),
                    "status" => (json!(self.step_status(id).to_string()), segments.collect()),
                    _ => return None,
                }
            }
            "loops" => {
                let id = segments.next()?;
                if segments.next()? != "iteration" {
                    return None;
                }
                (json!(self.loop_iterations.get(id)?), segments.collect())
            }
            _ => return None,
        };

        let mut current = base;
        for segment in rest {
            current = match current {
                Value::Object(mut map) => map.remove(segment)?,
                Value::Array(mut items) => {
                    let index: usize = segment.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }

    // -- serialization ------------------------------------------------------

    pub fn to_json(&self) -> Result<Value, ContextError> {
        serde_json::to_value(self).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    /// Build the scope expressions are evaluated against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "input": { ... },
    ///   "variables": { ... },
    ///   "steps": { "<id>": { "output": <value>, "status": "completed" } },
    ///   "loops": { "<id>": { "iteration": 2 } },
    ///   "workflow": { "name": "...", "run_id": "..." },
    ///   "<input field>": ..., "<variable>": ...
    /// }
    /// ```
    /// Input fields then variables are also flattened to the top level so
    /// expressions can say `count < 3` instead of `variables.count < 3`.
    pub fn to_expression_context(&self) -> Value {
        let mut scope = serde_json::Map::new();

        if let Value::Object(input) = &self.input_data {
            for (k, v) in input {
                scope.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.variables {
            scope.insert(k.clone(), v.clone());
        }
        scope.retain(|k, _| !RESERVED_SCOPE_KEYS.contains(&k.as_str()));

        let mut steps = serde_json::Map::new();
        let ids = self
            .step_results
            .keys()
            .chain(&self.completed_steps)
            .chain(&self.failed_steps)
            .chain(&self.skipped_steps);
        for id in ids {
            steps.insert(
                id.clone(),
                json!({
                    "output": self.step_results.get(id).cloned().unwrap_or(Value::Null),
                    "status": self.step_status(id).to_string(),
                }),
            );
        }

        let loops: serde_json::Map<String, Value> = self
            .loop_iterations
            .iter()
            .map(|(id, n)| (id.clone(), json!({ "iteration": n })))
            .collect();

        scope.insert("input".to_string(), self.input_data.clone());
        scope.insert("variables".to_string(), json!(self.variables));
        scope.insert("steps".to_string(), Value::Object(steps));
        scope.insert("loops".to_string(), Value::Object(loops));
        scope.insert(
            "workflow".to_string(),
            json!({
                "name": self.workflow_name,
                "run_id": self.run_id.to_string(),
            }),
        );
        Value::Object(scope)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn serialized_len(value: &Value) -> Result<usize, ContextError> {
    serde_json::to_string(value)
        .map(|s| s.len())
        .map_err(|e| ContextError::Serialization(e.to_string()))
}

fn truncation_marker(original_size: usize) -> Value {
    json!({
        "_truncated": true,
        "_original_size": original_size,
        "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
    })
}

/// The path inside `s` when `s` is exactly one `{{ path }}` placeholder.
fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Display form of a value inside a larger string.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            "test-workflow",
            json!({ "query": "2+2", "user": { "name": "ada" } }),
            BTreeMap::from([("count".to_string(), json!(0))]),
        )
    }

    #[test]
    fn status_sets_are_mutually_exclusive() {
        let mut ctx = test_context();
        ctx.mark_failed("a");
        ctx.mark_completed("a");
        assert!(ctx.completed_steps.contains("a"));
        assert!(!ctx.failed_steps.contains("a"));
        assert_eq!(ctx.step_status("a"), StepStatus::Completed);

        ctx.mark_skipped("a");
        assert_eq!(ctx.step_status("a"), StepStatus::Skipped);
        assert!(ctx.is_resolved("a"));
        assert!(ctx.completed_steps.is_empty());
    }

    #[test]
    fn reset_returns_steps_to_pending() {
        let mut ctx = test_context();
        ctx.set_step_result("b1", json!("x")).unwrap();
        ctx.mark_completed("b1");
        ctx.reset_steps(&["b1".to_string()]);
        assert_eq!(ctx.step_status("b1"), StepStatus::Pending);
        assert!(ctx.step_result("b1").is_none());
    }

    #[test]
    fn resolves_placeholders_in_strings() {
        let mut ctx = test_context();
        ctx.set_step_result("fetch", json!({ "title": "news" })).unwrap();
        ctx.loop_iterations.insert("l1".to_string(), 2);

        assert_eq!(ctx.resolve_template("Q: {{ input.query }}"), "Q: 2+2");
        assert_eq!(ctx.resolve_template("{{input.user.name}}!"), "ada!");
        assert_eq!(ctx.resolve_template("n={{ variables.count }}"), "n=0");
        assert_eq!(
            ctx.resolve_template("t={{ steps.fetch.output.title }}"),
            "t=news"
        );
        assert_eq!(ctx.resolve_template("i={{ loops.l1.iteration }}"), "i=2");
        assert_eq!(
            ctx.resolve_template("s={{ steps.fetch.status }}"),
            "s=pending"
        );
    }

    #[test]
    fn unknown_references_stay_verbatim() {
        let ctx = test_context();
        assert_eq!(
            ctx.resolve_template("{{ steps.missing.output }} and {{ nope }}"),
            "{{ steps.missing.output }} and {{ nope }}"
        );
        assert_eq!(ctx.resolve_template("open {{ only"), "open {{ only");
    }

    #[test]
    fn single_placeholder_keeps_raw_value() {
        let mut ctx = test_context();
        ctx.set_step_result("fetch", json!({ "items": [1, 2] })).unwrap();

        let mapping = json!({
            "data": "{{ steps.fetch.output }}",
            "first": "{{ steps.fetch.output.items.0 }}",
            "label": "query: {{ input.query }}",
            "nested": ["{{ variables.count }}"],
        });
        let resolved = ctx.resolve_value(&mapping);
        assert_eq!(resolved["data"], json!({ "items": [1, 2] }));
        assert_eq!(resolved["first"], json!(1));
        assert_eq!(resolved["label"], json!("query: 2+2"));
        assert_eq!(resolved["nested"], json!([0]));
    }

    #[test]
    fn oversized_result_is_truncated() {
        let mut ctx = test_context();
        let large = "x".repeat(MAX_STEP_OUTPUT_SIZE + 100);
        ctx.set_step_result("big", json!(large)).unwrap();
        assert_eq!(ctx.step_result("big").unwrap()["_truncated"], json!(true));
    }

    #[test]
    fn total_size_limit_is_enforced() {
        let mut ctx = test_context();
        let chunk = "y".repeat(MAX_STEP_OUTPUT_SIZE - 100);
        let mut result = Ok(());
        for i in 0..12 {
            result = ctx.set_step_result(&format!("s{i}"), json!(chunk));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ContextError::TooLarge { .. })));
    }

    #[test]
    fn json_roundtrip_preserves_progress() {
        let mut ctx = test_context();
        ctx.set_step_result("start", json!({ "status": "started" })).unwrap();
        ctx.mark_completed("start");
        ctx.activated_steps.insert("good".to_string());
        ctx.touch();

        let restored = ExecutionContext::from_json(ctx.to_json().unwrap()).unwrap();
        assert_eq!(restored.run_id, ctx.run_id);
        assert_eq!(restored.version, 1);
        assert!(restored.completed_steps.contains("start"));
        assert!(restored.activated_steps.contains("good"));
        assert_eq!(restored.variables["count"], json!(0));
    }

    #[test]
    fn expression_context_shape() {
        let mut ctx = test_context();
        ctx.set_step_result("fetch", json!("news")).unwrap();
        ctx.mark_completed("fetch");
        ctx.variables.insert("steps".to_string(), json!("shadow"));

        let scope = ctx.to_expression_context();
        assert_eq!(scope["steps"]["fetch"]["output"], json!("news"));
        assert_eq!(scope["steps"]["fetch"]["status"], json!("completed"));
        assert_eq!(scope["workflow"]["name"], json!("test-workflow"));
        assert_eq!(scope["query"], json!("2+2"));
        assert_eq!(scope["count"], json!(0));
        assert_eq!(scope["variables"]["steps"], json!("shadow"));
    }
}
