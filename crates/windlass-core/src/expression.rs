//! Expression evaluation port with a JEXL-backed default.
//!
//! Transition guards are evaluated against a variable scope assembled by the
//! interpreter (parent-chain walk, inner scopes shadowing outer). Evaluation
//! must be side-effect-free.
//!
//! Variable scopes are always passed as context objects, NEVER interpolated
//! into expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator port
// ---------------------------------------------------------------------------

/// Side-effect-free expression evaluation over a variable scope.
///
/// The engine consumes this as an opaque capability; `JexlEvaluator` is the
/// bundled implementation.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` with `scope` as the variable context.
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate and require a boolean result (used for transition guards).
    fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean { result: other }),
        }
    }
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let truthy = match &val {
                    Value::Bool(b) => *b,
                    Value::Null => false,
                    Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                    Value::String(s) => !s.is_empty(),
                    Value::Array(_) | Value::Object(_) => true,
                };
                Ok(json!(!truthy))
            });
        Self { evaluator }
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
