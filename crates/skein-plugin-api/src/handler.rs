//! Rooted references to Lua callables.

use std::fmt;
use std::sync::Arc;

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, RegistryKey, Result as LuaResult, Value};

use crate::error::{PluginError, PluginResult};

/// A Lua function kept alive in the Lua registry of the state it came from.
///
/// Lua functions cannot outlive the call they were passed to unless they are
/// rooted. A `HandlerRef` holds that root together with its state: every
/// clone shares both, and the function is unrooted when the last clone is
/// dropped. Unrooted slots are reclaimed on the next
/// `Lua::expire_registry_values` pass. The state lives on while any handler
/// rooted in it does, even after its module is unloaded.
#[derive(Clone)]
pub struct HandlerRef {
    inner: Arc<Rooted>,
}

struct Rooted {
    key: RegistryKey,
    lua: Lua,
    label: String,
}

impl HandlerRef {
    /// Root `value` if it is a function.
    pub fn root(lua: &Lua, value: Value, label: impl Into<String>) -> PluginResult<Self> {
        match value {
            Value::Function(func) => Ok(Self::from_function(lua, func, label)?),
            other => Err(PluginError::NotAFunction {
                got: other.type_name(),
            }),
        }
    }

    /// Store a function in the Lua registry and create a reference to it.
    pub fn from_function(lua: &Lua, func: Function, label: impl Into<String>) -> LuaResult<Self> {
        let key = lua.create_registry_value(func)?;
        Ok(Self {
            inner: Arc::new(Rooted {
                key,
                lua: lua.clone(),
                label: label.into(),
            }),
        })
    }

    /// The state the function belongs to. Calls into it are serialized.
    pub fn lua(&self) -> &Lua {
        &self.inner.lua
    }

    /// Fetch the rooted function.
    pub fn function(&self) -> LuaResult<Function> {
        self.inner.lua.registry_value(&self.inner.key)
    }

    /// Retrieve the function from the registry and call it.
    pub fn call<R: FromLuaMulti>(&self, args: impl IntoLuaMulti) -> LuaResult<R> {
        self.function()?.call(args)
    }

    /// Human readable origin of the function, used in logs.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Number of live clones sharing this root.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef")
            .field("label", &self.inner.label)
            .field("holders", &self.holders())
            .finish()
    }
}
