//! Runtime values and their JSON mapping.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;

/// A value inside a running script. Maps are string-keyed and sorted
/// so serialized results are deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ScriptValue>),
    Map(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Int(v) => *v != 0,
            ScriptValue::Float(v) => *v != 0.0,
            ScriptValue::Str(s) => !s.is_empty(),
            ScriptValue::List(items) => !items.is_empty(),
            ScriptValue::Map(entries) => !entries.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Int(_) => "int",
            ScriptValue::Float(_) => "float",
            ScriptValue::Str(_) => "string",
            ScriptValue::List(_) => "list",
            ScriptValue::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(v) => Some(*v),
            ScriptValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(v) => Some(*v as f64),
            ScriptValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            ScriptValue::Null => Json::Null,
            ScriptValue::Bool(b) => Json::Bool(*b),
            ScriptValue::Int(v) => Json::from(*v),
            ScriptValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            ScriptValue::Str(s) => Json::from(s.clone()),
            ScriptValue::List(items) => Json::Array(items.iter().map(|v| v.to_json()).collect()),
            ScriptValue::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(value: &Json) -> Self {
        match value {
            Json::Null => ScriptValue::Null,
            Json::Bool(b) => ScriptValue::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ScriptValue::Int(i)
                } else {
                    ScriptValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => ScriptValue::Str(s.clone()),
            Json::Array(items) => {
                ScriptValue::List(items.iter().map(ScriptValue::from_json).collect())
            }
            Json::Object(entries) => ScriptValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), ScriptValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Int(v) => write!(f, "{v}"),
            ScriptValue::Float(v) => write!(f, "{v}"),
            ScriptValue::Str(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_preserves_structure() {
        let json = json!({"a": 1, "b": [true, null, "x"], "c": 1.5});
        let value = ScriptValue::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn truthiness_matches_emptiness() {
        assert!(!ScriptValue::Null.truthy());
        assert!(!ScriptValue::Str(String::new()).truthy());
        assert!(ScriptValue::Int(-1).truthy());
        assert!(!ScriptValue::List(vec![]).truthy());
    }
}
