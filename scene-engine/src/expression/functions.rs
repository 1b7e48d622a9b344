// Built-in Functions
// Helpers callable from condition expressions, either as `f(a, b)` or `a.f(b)`

use crate::expression::evaluator::{compare, values_equal, EvalError};
use crate::state::Value;

/// Registry of built-in functions
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    /// Names are matched case-insensitively, so `startsWith` and `startswith` agree
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            // Comparison
            "eq" => self.binary(args, "eq", |a, b| Ok(Value::Bool(values_equal(a, b)))),
            "ne" => self.binary(args, "ne", |a, b| Ok(Value::Bool(!values_equal(a, b)))),
            "lt" => self.binary(args, "lt", |a, b| Ok(Value::Bool(compare(a, b)?.is_lt()))),
            "le" => self.binary(args, "le", |a, b| Ok(Value::Bool(compare(a, b)?.is_le()))),
            "gt" => self.binary(args, "gt", |a, b| Ok(Value::Bool(compare(a, b)?.is_gt()))),
            "ge" => self.binary(args, "ge", |a, b| Ok(Value::Bool(compare(a, b)?.is_ge()))),
            "in" => self.fn_in(args).map(Value::Bool),
            "notin" => self.fn_in(args).map(|found| Value::Bool(!found)),

            // Logical
            "and" => Ok(Value::Bool(
                !args.is_empty() && args.iter().all(Value::is_truthy),
            )),
            "or" => Ok(Value::Bool(args.iter().any(Value::is_truthy))),
            "not" => {
                self.require_args(&args, 1, "not")?;
                Ok(Value::Bool(!args[0].is_truthy()))
            }
            "xor" => self.binary(args, "xor", |a, b| {
                Ok(Value::Bool(a.is_truthy() != b.is_truthy()))
            }),

            // Strings and collections
            "contains" | "includes" => self.binary(args, "contains", |haystack, needle| {
                Ok(Value::Bool(contains(haystack, needle)))
            }),
            "startswith" => self.binary(args, "startsWith", |s, prefix| {
                Ok(Value::Bool(s.as_string().starts_with(&prefix.as_string())))
            }),
            "endswith" => self.binary(args, "endsWith", |s, suffix| {
                Ok(Value::Bool(s.as_string().ends_with(&suffix.as_string())))
            }),
            "lower" | "tolowercase" => self.unary_string(args, "lower", |s| s.to_lowercase()),
            "upper" | "touppercase" => self.unary_string(args, "upper", |s| s.to_uppercase()),
            "trim" => self.unary_string(args, "trim", |s| s.trim().to_string()),
            "length" => self.fn_length(args),

            // Numeric
            "abs" => {
                self.require_args(&args, 1, "abs")?;
                let n = self.number(&args[0], "abs")?;
                Ok(Value::Number(n.abs()))
            }
            "min" => self.fold_numbers(args, "min", f64::min),
            "max" => self.fold_numbers(args, "max", f64::max),

            // Utility
            "coalesce" => Ok(args
                .into_iter()
                .find(|v| !matches!(v, Value::Null) && !matches!(v, Value::String(s) if s.is_empty()))
                .unwrap_or(Value::Null)),
            "iif" => {
                self.require_args(&args, 3, "iif")?;
                let mut args = args;
                let else_value = args.pop().unwrap_or_default();
                let then_value = args.pop().unwrap_or_default();
                Ok(if args[0].is_truthy() { then_value } else { else_value })
            }

            _ => Err(EvalError::UnknownFunction(name.to_string())),
        }
    }

    fn fn_in(&self, args: Vec<Value>) -> Result<bool, EvalError> {
        if args.len() < 2 {
            return Err(EvalError::new("in() requires at least 2 arguments"));
        }
        let needle = &args[0];
        Ok(args[1..].iter().any(|candidate| match candidate {
            Value::Array(items) => items.iter().any(|item| values_equal(needle, item)),
            other => values_equal(needle, other),
        }))
    }

    fn fn_length(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 1, "length")?;
        let len = match &args[0] {
            Value::Null => 0,
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            other => return Err(EvalError::new(format!("length() of {:?}", other))),
        };
        Ok(Value::Number(len as f64))
    }

    fn fold_numbers(
        &self,
        args: Vec<Value>,
        name: &str,
        fold: fn(f64, f64) -> f64,
    ) -> Result<Value, EvalError> {
        // Accept either variadic numbers or a single array
        let values = match args.as_slice() {
            [Value::Array(items)] => items.clone(),
            _ => args,
        };

        let mut numbers = values.iter().map(|v| self.number(v, name));
        let first = numbers
            .next()
            .ok_or_else(|| EvalError::new(format!("{}() requires at least 1 argument", name)))??;
        numbers
            .try_fold(first, |acc, n| -> Result<f64, EvalError> { Ok(fold(acc, n?)) })
            .map(Value::Number)
    }

    fn binary<F>(&self, args: Vec<Value>, name: &str, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&Value, &Value) -> Result<Value, EvalError>,
    {
        self.require_args(&args, 2, name)?;
        f(&args[0], &args[1])
    }

    fn unary_string<F>(&self, args: Vec<Value>, name: &str, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&str) -> String,
    {
        self.require_args(&args, 1, name)?;
        Ok(Value::String(f(&args[0].as_string())))
    }

    fn number(&self, value: &Value, name: &str) -> Result<f64, EvalError> {
        value
            .as_number()
            .ok_or_else(|| EvalError::new(format!("{}() expects numbers, got {:?}", name, value)))
    }

    fn require_args(&self, args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
        if args.len() != count {
            return Err(EvalError::new(format!(
                "{}() requires exactly {} argument(s), got {}",
                name,
                count,
                args.len()
            )));
        }
        Ok(())
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => map.contains_key(&needle.as_string()),
        other => other.as_string().contains(&needle.as_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::expression::evaluator::{Environment, ExpressionEngine, ExpressionEvaluator};
    use crate::state::Value;

    fn eval(expr: &str) -> Value {
        let environment = Environment::from([
            ("agv1.name".to_string(), Value::from("AGV-01")),
            (
                "zones".to_string(),
                Value::from(vec!["dock", "aisle", "charger"]),
            ),
        ]);
        ExpressionEngine::new().evaluate(expr, &environment).unwrap()
    }

    #[test]
    fn test_comparison_functions() {
        assert_eq!(eval("eq(1, 1)"), Value::Bool(true));
        assert_eq!(eval("ne('a', 'b')"), Value::Bool(true));
        assert_eq!(eval("lt(1, 2)"), Value::Bool(true));
        assert_eq!(eval("ge(2, 3)"), Value::Bool(false));
    }

    #[test]
    fn test_in_and_notin() {
        assert_eq!(eval("in('dock', zones)"), Value::Bool(true));
        assert_eq!(eval("in(2, 1, 2, 3)"), Value::Bool(true));
        assert_eq!(eval("notin('roof', zones)"), Value::Bool(true));
    }

    #[test]
    fn test_logical_functions() {
        assert_eq!(eval("and(true, 1, 'x')"), Value::Bool(true));
        assert_eq!(eval("or(false, 0)"), Value::Bool(false));
        assert_eq!(eval("not(false)"), Value::Bool(true));
        assert_eq!(eval("xor(true, true)"), Value::Bool(false));
    }

    #[test]
    fn test_method_style_string_functions() {
        assert_eq!(eval("agv1.name.startsWith('AGV')"), Value::Bool(true));
        assert_eq!(eval("agv1.name.endsWith('02')"), Value::Bool(false));
        assert_eq!(eval("agv1.name.toLowerCase()"), Value::from("agv-01"));
        assert_eq!(eval("zones.includes('aisle')"), Value::Bool(true));
    }

    #[test]
    fn test_numeric_functions() {
        assert_eq!(eval("abs(-3)"), Value::Number(3.0));
        assert_eq!(eval("max(1, 7, 3)"), Value::Number(7.0));
        assert_eq!(eval("min([4, 2, 9])"), Value::Number(2.0));
    }

    #[test]
    fn test_utility_functions() {
        assert_eq!(eval("coalesce(null, '', 'fallback')"), Value::from("fallback"));
        assert_eq!(eval("iif(length(zones) > 2, 'many', 'few')"), Value::from("many"));
        assert_eq!(eval("length(agv1.name)"), Value::Number(6.0));
    }

    #[test]
    fn test_unknown_function() {
        let result = ExpressionEngine::new().evaluate("launch()", &Environment::new());
        assert!(matches!(
            result,
            Err(crate::expression::evaluator::EvalError::UnknownFunction(name)) if name == "launch"
        ));
    }
}
