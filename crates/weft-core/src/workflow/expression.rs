//! JEXL evaluator for step conditions, Condition steps and loop exit checks.
//!
//! Context values are always passed as the evaluation scope, never spliced
//! into the expression text.
//!
//! `jexl_eval::Evaluator` is not `Send`, so callers inside async code build
//! one per evaluation through the free functions at the bottom of this file.

use serde_json::{Value, json};

use super::context::ExecutionContext;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("invalid expression context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with the standard transforms registered.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        items.contains(args.get(1).unwrap_or(&Value::Null))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, scope).map(|v| truthy(&v))
    }

    /// Evaluate and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidContext(
                "scope must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluate a boolean expression against an execution context.
    pub fn evaluate_in_context(
        &self,
        expression: &str,
        ctx: &ExecutionContext,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, &ctx.to_expression_context())
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a condition against a context with a fresh evaluator.
pub fn evaluate_condition(expression: &str, ctx: &ExecutionContext) -> Result<bool, ExpressionError> {
    ExpressionEvaluator::new().evaluate_in_context(expression, ctx)
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use uuid::Uuid;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    #[test]
    fn dot_notation_and_comparison() {
        let scope = json!({ "event": { "user": { "name": "Alice" } }, "count": 2 });
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("event.user.name", &scope).unwrap(),
            json!("Alice")
        );
        assert!(eval.evaluate_bool("event.user.name == 'Alice'", &scope).unwrap());
        assert!(eval.evaluate_bool("count < 3 && count > 1", &scope).unwrap());
    }

    #[test]
    fn transforms() {
        let scope = json!({ "title": "  Hello World ", "tags": ["a", "b"] });
        let eval = evaluator();
        assert!(eval.evaluate_bool("title|trim|lower == 'hello world'", &scope).unwrap());
        assert!(eval.evaluate_bool("title|contains('World')", &scope).unwrap());
        assert!(eval.evaluate_bool("tags|contains('b')", &scope).unwrap());
        assert!(eval.evaluate_bool("tags|length == 2", &scope).unwrap());
        assert!(eval.evaluate_bool("false|not", &scope).unwrap());
    }

    #[test]
    fn truthiness_coercion() {
        let eval = evaluator();
        let scope = json!({ "empty": "", "zero": 0, "list": [], "nothing": null });
        assert!(!eval.evaluate_bool("empty", &scope).unwrap());
        assert!(!eval.evaluate_bool("zero", &scope).unwrap());
        assert!(eval.evaluate_bool("list", &scope).unwrap());
        assert!(!eval.evaluate_bool("nothing", &scope).unwrap());
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = evaluator()
            .evaluate_bool("count >", &json!({ "count": 1 }))
            .unwrap_err();
        assert!(matches!(err, ExpressionError::EvalFailed { .. }));
    }

    #[test]
    fn non_object_scope_is_rejected() {
        let err = evaluator().evaluate_bool("true", &json!(1)).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn evaluates_against_execution_context() {
        let mut ctx = ExecutionContext::new(
            Uuid::now_v7(),
            "wf",
            json!({ "flag": true }),
            BTreeMap::from([("count".to_string(), json!(2))]),
        );
        ctx.set_step_result("fetch", json!({ "ok": true })).unwrap();
        ctx.mark_completed("fetch");

        assert!(evaluate_condition("flag", &ctx).unwrap());
        assert!(evaluate_condition("variables.count == 2", &ctx).unwrap());
        assert!(evaluate_condition("steps.fetch.output.ok", &ctx).unwrap());
        assert!(evaluate_condition("steps.fetch.status == 'completed'", &ctx).unwrap());
    }
}
