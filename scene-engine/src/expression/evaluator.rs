// Expression Evaluator
// Evaluates condition ASTs against a flat dotted-path environment

use crate::expression::functions::BuiltinFunctions;
use crate::expression::parser::{BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart, UnaryOp};
use crate::state::Value;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Evaluation environment: dotted path -> value
pub type Environment = HashMap<String, Value>;

/// Evaluation error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error(transparent)]
    Parse(#[from] ParseExprError),

    #[error("unknown state path '{0}'")]
    UnknownPath(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("evaluation error: {0}")]
    Invalid(String),
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Turns condition text plus an environment into a value.
///
/// The engine only depends on this trait; [`ExpressionEngine`] is the
/// bundled implementation.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, environment: &Environment) -> Result<Value, EvalError>;

    /// Evaluate and coerce to a boolean using truthiness
    fn evaluate_bool(&self, expression: &str, environment: &Environment) -> Result<bool, EvalError> {
        Ok(self.evaluate(expression, environment)?.is_truthy())
    }
}

/// Tree-walking evaluator over a borrowed environment
pub struct Evaluator<'a> {
    environment: &'a Environment,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(environment: &'a Environment) -> Self {
        Self {
            environment,
            functions: BuiltinFunctions::new(),
        }
    }

    /// Evaluate an expression
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Reference(reference) => self.eval_reference(reference),

            Expr::FunctionCall { name, args } => {
                let evaluated: Result<Vec<Value>, EvalError> =
                    args.iter().map(|a| self.eval(a)).collect();
                self.functions.call(name, evaluated?)
            }

            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let idx = self.eval(index)?;
                self.eval_index(&obj, &idx)
            }

            Expr::Member { object, property } => {
                let obj = self.eval(object)?;
                self.eval_member(&obj, property)
            }

            Expr::Unary { op, expr } => {
                let val = self.eval(expr)?;
                self.eval_unary(*op, &val)
            }

            Expr::Binary { op, left, right } => match op {
                // Short-circuit evaluation for && and ||
                BinaryOp::And => {
                    if !self.eval(left)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.eval(right)?.is_truthy()))
                }
                BinaryOp::Or => {
                    if self.eval(left)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.eval(right)?.is_truthy()))
                }
                _ => {
                    let left_val = self.eval(left)?;
                    let right_val = self.eval(right)?;
                    self.eval_binary(*op, &left_val, &right_val)
                }
            },

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }

            Expr::Array(items) => {
                let values: Result<Vec<Value>, EvalError> =
                    items.iter().map(|e| self.eval(e)).collect();
                Ok(Value::Array(values?))
            }
        }
    }

    /// Resolve the longest dotted prefix present in the environment, then
    /// navigate the remaining parts inside the stored value.
    fn eval_reference(&self, reference: &Reference) -> Result<Value, EvalError> {
        let properties: Vec<&str> = reference
            .parts
            .iter()
            .map_while(|part| match part {
                ReferencePart::Property(name) => Some(name.as_str()),
                ReferencePart::Index(_) => None,
            })
            .collect();

        let resolved = (1..=properties.len()).rev().find_map(|len| {
            self.environment
                .get(&properties[..len].join("."))
                .map(|value| (value.clone(), len))
        });

        let Some((mut current, consumed)) = resolved else {
            return Err(EvalError::UnknownPath(reference.dotted_prefix()));
        };

        for part in &reference.parts[consumed..] {
            current = match part {
                ReferencePart::Property(name) => self.eval_member(&current, name)?,
                ReferencePart::Index(index_expr) => {
                    let index = self.eval(index_expr)?;
                    self.eval_index(&current, &index)?
                }
            };
        }

        Ok(current)
    }

    fn eval_index(&self, object: &Value, index: &Value) -> Result<Value, EvalError> {
        match (object, index) {
            (Value::Array(arr), Value::Number(n)) => {
                let i = *n as usize;
                arr.get(i)
                    .cloned()
                    .ok_or_else(|| EvalError::new(format!("array index {} out of bounds", i)))
            }
            (Value::Object(map), Value::String(key)) => {
                Ok(map.get(key).cloned().unwrap_or(Value::Null))
            }
            (Value::Object(map), Value::Number(_)) => {
                Ok(map.get(&index.as_string()).cloned().unwrap_or(Value::Null))
            }
            (Value::String(s), Value::Number(n)) => {
                let i = *n as usize;
                s.chars()
                    .nth(i)
                    .map(|c| Value::String(c.to_string()))
                    .ok_or_else(|| EvalError::new(format!("string index {} out of bounds", i)))
            }
            _ => Err(EvalError::new(format!(
                "cannot index {} with {}",
                object.type_name(),
                index.type_name()
            ))),
        }
    }

    fn eval_member(&self, object: &Value, property: &str) -> Result<Value, EvalError> {
        match object {
            Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
            Value::Array(arr) if property == "length" => Ok(Value::Number(arr.len() as f64)),
            Value::String(s) if property == "length" => Ok(Value::Number(s.len() as f64)),
            _ => Err(EvalError::new(format!(
                "{} has no property '{}'",
                object.type_name(),
                property
            ))),
        }
    }

    fn eval_unary(&self, op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
            UnaryOp::Neg => match value {
                Value::Number(n) => Ok(Value::Number(-n)),
                _ => Err(EvalError::new("cannot negate non-number")),
            },
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match op {
            BinaryOp::Add => self.eval_add(left, right),
            BinaryOp::Sub => self.eval_numeric_op(left, right, |a, b| a - b),
            BinaryOp::Mul => self.eval_numeric_op(left, right, |a, b| a * b),
            BinaryOp::Div => self.eval_numeric_op(left, right, |a, b| a / b),
            BinaryOp::Mod => self.eval_numeric_op(left, right, |a, b| a % b),

            BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
            BinaryOp::Lt => compare(left, right).map(|o| Value::Bool(o.is_lt())),
            BinaryOp::Le => compare(left, right).map(|o| Value::Bool(o.is_le())),
            BinaryOp::Gt => compare(left, right).map(|o| Value::Bool(o.is_gt())),
            BinaryOp::Ge => compare(left, right).map(|o| Value::Bool(o.is_ge())),

            // Handled in eval() for short-circuit
            BinaryOp::And | BinaryOp::Or => Err(EvalError::new("logical operator out of place")),
        }
    }

    fn eval_add(&self, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, b.as_string()))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", a.as_string(), b))),
            _ => Err(EvalError::new("cannot add these types")),
        }
    }

    fn eval_numeric_op<F>(&self, left: &Value, right: &Value, op: F) -> Result<Value, EvalError>
    where
        F: FnOnce(f64, f64) -> f64,
    {
        let a = left
            .as_number()
            .ok_or_else(|| EvalError::new("left operand is not a number"))?;
        let b = right
            .as_number()
            .ok_or_else(|| EvalError::new("right operand is not a number"))?;
        Ok(Value::Number(op(a, b)))
    }
}

/// Loose equality: numbers compare numerically (strings are coerced),
/// booleans match their string spelling.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => b
            .parse::<f64>()
            .map(|n| (a - n).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            (*a && b == "true") || (!*a && b == "false")
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

/// Ordering for comparison operators: strings lexically, everything else numerically
pub(crate) fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        if a.parse::<f64>().is_err() || b.parse::<f64>().is_err() {
            return Ok(a.cmp(b));
        }
    }

    let a = left
        .as_number()
        .ok_or_else(|| EvalError::new(format!("cannot compare {} with {}", left.type_name(), right.type_name())))?;
    let b = right
        .as_number()
        .ok_or_else(|| EvalError::new(format!("cannot compare {} with {}", left.type_name(), right.type_name())))?;
    a.partial_cmp(&b)
        .ok_or_else(|| EvalError::new("comparison with NaN"))
}

const AST_CACHE_LIMIT: usize = 1024;

/// Default evaluator: parses expressions once and caches the AST
#[derive(Default)]
pub struct ExpressionEngine {
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse (or fetch from cache) an expression
    pub fn parse(&self, expression: &str) -> Result<Arc<Expr>, EvalError> {
        if let Some(ast) = self.cache.lock().get(expression) {
            return Ok(ast.clone());
        }

        let ast = Arc::new(ExprParser::parse_str(expression)?);

        let mut cache = self.cache.lock();
        if cache.len() >= AST_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(expression.to_string(), ast.clone());
        Ok(ast)
    }
}

impl ExpressionEvaluator for ExpressionEngine {
    fn evaluate(&self, expression: &str, environment: &Environment) -> Result<Value, EvalError> {
        let ast = self.parse(expression)?;
        Evaluator::new(environment).eval(&ast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, Value)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(expr: &str, environment: &Environment) -> Result<Value, EvalError> {
        ExpressionEngine::new().evaluate(expr, environment)
    }

    #[test]
    fn test_threshold_comparison() {
        let environment = env(&[("temperature", Value::from(26.5))]);
        assert_eq!(eval("temperature >= 25.0", &environment), Ok(Value::Bool(true)));
        assert_eq!(eval("temperature < 25", &environment), Ok(Value::Bool(false)));
    }

    #[test]
    fn test_flat_dotted_key_lookup() {
        let environment = env(&[("agv1.sensor", Value::from("blocked"))]);
        assert_eq!(
            eval("agv1.sensor == 'blocked'", &environment),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn test_nested_object_lookup() {
        let agv = Value::Object(HashMap::from([(
            "motor".to_string(),
            Value::Object(HashMap::from([("rpm".to_string(), Value::from(1200.0))])),
        )]));
        let environment = env(&[("agv1", agv)]);

        assert_eq!(eval("agv1.motor.rpm > 1000", &environment), Ok(Value::Bool(true)));
        assert_eq!(eval("agv1.brake", &environment), Ok(Value::Null));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let environment = env(&[
            ("a", Value::Object(HashMap::from([("b".to_string(), Value::from(1.0))]))),
            ("a.b", Value::from(2.0)),
        ]);
        assert_eq!(eval("a.b", &environment), Ok(Value::Number(2.0)));
    }

    #[test]
    fn test_unknown_path_is_error() {
        assert_eq!(
            eval("missing.path == 1", &Environment::new()),
            Err(EvalError::UnknownPath("missing.path".to_string()))
        );
    }

    #[test]
    fn test_logical_short_circuit() {
        let environment = env(&[("ready", Value::from(false))]);
        // Right side would fail on an unknown path if evaluated
        assert_eq!(eval("ready && missing", &environment), Ok(Value::Bool(false)));
        assert_eq!(eval("!ready || missing", &environment), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_string_comparison_and_concat() {
        let environment = env(&[("state", Value::from("moving"))]);
        assert_eq!(eval("state == \"moving\"", &environment), Ok(Value::Bool(true)));
        assert_eq!(eval("'a' < 'b'", &environment), Ok(Value::Bool(true)));
        assert_eq!(
            eval("'state: ' + state", &environment),
            Ok(Value::from("state: moving"))
        );
    }

    #[test]
    fn test_index_access() {
        let environment = env(&[(
            "readings",
            Value::Array(vec![Value::from(1.0), Value::from(5.0)]),
        )]);
        assert_eq!(eval("readings[1] * 2", &environment), Ok(Value::Number(10.0)));
        assert!(eval("readings[7]", &environment).is_err());
    }

    #[test]
    fn test_evaluate_bool_uses_truthiness() {
        let engine = ExpressionEngine::new();
        let environment = env(&[("count", Value::from(3.0))]);
        assert_eq!(engine.evaluate_bool("count", &environment), Ok(true));
        assert_eq!(engine.evaluate_bool("count - 3", &environment), Ok(false));
    }

    #[test]
    fn test_parse_cache_reuses_ast() {
        let engine = ExpressionEngine::new();
        let first = engine.parse("a == 1").unwrap();
        let second = engine.parse("a == 1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
