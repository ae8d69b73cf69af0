//! Lua bindings for the plugin API.
//!
//! Plugins see two kinds of objects:
//! - the plugin object passed to a module chunk (`local plugin = ...`), with
//!   `plugin.id`, `plugin:addRoute(pattern, fn)` and `plugin:addSearcher(fn)`
//! - page model objects passed to handlers, with `appendItem`, `appendModel`
//!   and the assignable `title`, `entries`, `type`, `url`, `loading` and
//!   `paginator` fields

use mlua::{Lua, Result as LuaResult, Value};
use skein_prop::PropValue;

mod objects;

pub use objects::{ModelObject, PluginObject};

/// Convert a Lua value to a JSON value.
pub fn lua_value_to_json(lua: &Lua, value: Value) -> LuaResult<serde_json::Value> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        Value::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        Value::Number(n) => {
            if let Some(num) = serde_json::Number::from_f64(n) {
                Ok(serde_json::Value::Number(num))
            } else {
                Ok(serde_json::Value::Null)
            }
        }
        Value::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        Value::Table(t) => {
            // Sequences become arrays, everything else an object
            let is_array = t.clone().pairs::<i64, Value>().all(|r| r.is_ok());

            if is_array && t.raw_len() > 0 {
                let mut arr = Vec::new();
                for pair in t.sequence_values::<Value>() {
                    arr.push(lua_value_to_json(lua, pair?)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut obj = serde_json::Map::new();
                for pair in t.pairs::<Value, Value>() {
                    let (k, v) = pair?;
                    let key = match k {
                        Value::String(s) => s.to_str()?.to_string(),
                        Value::Integer(i) => i.to_string(),
                        _ => continue,
                    };
                    obj.insert(key, lua_value_to_json(lua, v)?);
                }
                Ok(serde_json::Value::Object(obj))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

/// Convert a Lua value assigned to a model field to a node value.
///
/// Strings, integers and floats map directly, booleans become 0/1 and
/// everything else clears the node.
pub fn lua_value_to_prop(value: &Value) -> LuaResult<PropValue> {
    Ok(match value {
        Value::String(s) => PropValue::String(s.to_str()?.to_string()),
        Value::Integer(i) => PropValue::Int(*i),
        Value::Number(n) => PropValue::Float(*n),
        Value::Boolean(b) => PropValue::Int(*b as i64),
        _ => PropValue::Void,
    })
}

/// Lua-style truthiness, extended so that `0` and `""` count as false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Nil => false,
        Value::Boolean(b) => *b,
        Value::Integer(i) => *i != 0,
        Value::Number(n) => *n != 0.0,
        Value::String(s) => !s.as_bytes().is_empty(),
        _ => true,
    }
}
