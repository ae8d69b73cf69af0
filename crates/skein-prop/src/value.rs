//! Scalar values stored on tree nodes.

use serde::Serialize;
use std::fmt;

/// The value held by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropValue {
    /// No value (directories, freshly created nodes).
    #[default]
    Void,
    String(String),
    Int(i64),
    Float(f64),
}

impl PropValue {
    /// Convert a JSON scalar. Containers map to `Void`; their content
    /// becomes child nodes (see [`crate::Prop::set_json`]).
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => PropValue::Int(*b as i64),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropValue::Int(i),
                None => n.as_f64().map(PropValue::Float).unwrap_or(PropValue::Void),
            },
            serde_json::Value::String(s) => PropValue::String(s.clone()),
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => PropValue::Void,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Void => Ok(()),
            PropValue::String(s) => f.write_str(s),
            PropValue::Int(i) => write!(f, "{}", i),
            PropValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::String(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::String(s)
    }
}

impl From<i64> for PropValue {
    fn from(i: i64) -> Self {
        PropValue::Int(i)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Int(b as i64)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}
