// State Values
// Dynamic value type shared by the state store, conditions and event payloads

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Runtime value stored under a state path and produced by expressions
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    /// Condition truthiness: null, false, zero, NaN and empty
    /// strings/collections are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    /// Numbers, and strings that parse as numbers (`"42"` from a YAML payload)
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// Display form used for string concatenation and log messages
    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            // 3.0 prints as "3"
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.to_json(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::Value::from(self.clone()).to_string()
    }

    /// Short type label for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Walk nested objects/arrays following dotted segments
    pub fn get_path<'a, I>(&self, segments: I) -> Option<&Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        segments
            .into_iter()
            .try_fold(self, |current, segment| match current {
                Value::Object(fields) => fields.get(segment),
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
                _ => None,
            })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

number_from!(i32, i64, u32, u64, usize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_of_sensor_readings() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(false).is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Array(Vec::new()).is_truthy());
        assert!(Value::from(0.1).is_truthy());
        assert!(Value::from("idle").is_truthy());
        assert!(Value::from(vec![1]).is_truthy());
    }

    #[test]
    fn test_display_strips_integral_fraction() {
        assert_eq!(Value::from(42.0).to_string(), "42");
        assert_eq!(Value::from(26.5).to_string(), "26.5");
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::from(vec![1, 2]).to_string(), "[1.0,2.0]");
    }

    #[test]
    fn test_numeric_strings_coerce() {
        assert_eq!(Value::from(" 12 ").as_number(), Some(12.0));
        assert_eq!(Value::from("dock").as_number(), None);
        assert_eq!(Value::from(true).as_number(), None);
        assert_eq!(Value::from(Some(3usize)), Value::Number(3.0));
        assert_eq!(Value::from(None::<bool>), Value::Null);
        assert_eq!(Value::from(1u64).type_name(), "number");
    }

    #[test]
    fn test_get_path() {
        let sensor = Value::Object(HashMap::from([(
            "sensor".to_string(),
            Value::Array(vec![Value::from(1.0), Value::from(2.0)]),
        )]));

        assert_eq!(sensor.get_path(["sensor", "1"]), Some(&Value::Number(2.0)));
        assert_eq!(sensor.get_path(["missing"]), None);
        assert_eq!(sensor.get_path([]), Some(&sensor));
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let value: Value = serde_yaml::from_str("{ speed: 3, active: true, name: agv }").unwrap();
        let Value::Object(map) = value else {
            panic!("expected object");
        };
        assert_eq!(map.get("speed"), Some(&Value::Number(3.0)));
        assert_eq!(map.get("active"), Some(&Value::Bool(true)));
        assert_eq!(map.get("name"), Some(&Value::from("agv")));
    }
}
