use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed value type for facts describing an in-flight action.
///
/// Rules operate over this small type system and nothing else; native
/// values are coerced on the way in via the `From` impls, and bridged to
/// [`serde_json::Value`] for fingerprinting and durable dumps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactValue {
    /// A fact that was requested but never computed or seeded.
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FactValue>),
}

impl FactValue {
    /// Truthiness as seen by rule evaluation: empty-ish values are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            FactValue::Undefined | FactValue::Null => false,
            FactValue::Bool(value) => *value,
            FactValue::Int(value) => *value != 0,
            FactValue::Float(value) => *value != 0.0,
            FactValue::Str(value) => !value.is_empty(),
            FactValue::List(items) => !items.is_empty(),
        }
    }

    /// Whether this fact carries no usable value.
    pub fn is_undefined(&self) -> bool {
        matches!(self, FactValue::Undefined)
    }

    /// String rendering used when a fact feeds a text-derived computation.
    pub fn render(&self) -> String {
        match self {
            FactValue::Undefined | FactValue::Null => String::new(),
            FactValue::Bool(value) => value.to_string(),
            FactValue::Int(value) => value.to_string(),
            FactValue::Float(value) => value.to_string(),
            FactValue::Str(value) => value.clone(),
            FactValue::List(items) => items
                .iter()
                .map(FactValue::render)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Bridge into a plain JSON value (used by the stash fingerprint).
    pub fn to_json(&self) -> Value {
        match self {
            FactValue::Undefined | FactValue::Null => Value::Null,
            FactValue::Bool(value) => Value::Bool(*value),
            FactValue::Int(value) => Value::from(*value),
            FactValue::Float(value) => {
                serde_json::Number::from_f64(*value).map(Value::Number).unwrap_or(Value::Null)
            }
            FactValue::Str(value) => Value::String(value.clone()),
            FactValue::List(items) => Value::Array(items.iter().map(FactValue::to_json).collect()),
        }
    }

    /// Coerce a plain JSON value into the closed fact type system.
    pub fn from_json(value: &Value) -> FactValue {
        match value {
            Value::Null => FactValue::Null,
            Value::Bool(inner) => FactValue::Bool(*inner),
            Value::Number(number) => match number.as_i64() {
                Some(int) => FactValue::Int(int),
                None => FactValue::Float(number.as_f64().unwrap_or(0.0)),
            },
            Value::String(text) => FactValue::Str(text.clone()),
            Value::Array(items) => FactValue::List(items.iter().map(FactValue::from_json).collect()),
            Value::Object(_) => FactValue::Str(value.to_string()),
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        FactValue::Bool(value)
    }
}

impl From<i64> for FactValue {
    fn from(value: i64) -> Self {
        FactValue::Int(value)
    }
}

impl From<i32> for FactValue {
    fn from(value: i32) -> Self {
        FactValue::Int(value as i64)
    }
}

impl From<u64> for FactValue {
    fn from(value: u64) -> Self {
        FactValue::Int(value as i64)
    }
}

impl From<usize> for FactValue {
    fn from(value: usize) -> Self {
        FactValue::Int(value as i64)
    }
}

impl From<f64> for FactValue {
    fn from(value: f64) -> Self {
        FactValue::Float(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        FactValue::Str(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        FactValue::Str(value)
    }
}

impl From<Vec<FactValue>> for FactValue {
    fn from(items: Vec<FactValue>) -> Self {
        FactValue::List(items)
    }
}

impl From<Vec<String>> for FactValue {
    fn from(items: Vec<String>) -> Self {
        FactValue::List(items.into_iter().map(FactValue::Str).collect())
    }
}

impl<T: Into<FactValue>> From<Option<T>> for FactValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => FactValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!FactValue::Undefined.is_truthy());
        assert!(!FactValue::Str(String::new()).is_truthy());
        assert!(!FactValue::Int(0).is_truthy());
        assert!(FactValue::Str("x".into()).is_truthy());
        assert!(FactValue::List(vec![FactValue::Null]).is_truthy());
    }

    #[test]
    fn json_bridge_preserves_shape() {
        let value = FactValue::List(vec![
            FactValue::Int(3),
            FactValue::Str("abc".into()),
            FactValue::Bool(true),
        ]);
        let bridged = FactValue::from_json(&value.to_json());
        assert_eq!(bridged, value);
    }

    #[test]
    fn numbers_coerce_to_int_when_integral() {
        assert_eq!(FactValue::from_json(&json!(7)), FactValue::Int(7));
        assert_eq!(FactValue::from_json(&json!(1.5)), FactValue::Float(1.5));
    }

    #[test]
    fn renders_lists_line_by_line() {
        let value = FactValue::List(vec![FactValue::Str("a".into()), FactValue::Str("b".into())]);
        assert_eq!(value.render(), "a\nb");
    }
}
