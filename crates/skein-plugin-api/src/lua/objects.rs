//! Userdata wrappers exposed to plugin code.

use std::sync::Arc;

use mlua::{AnyUserData, Table, UserData, UserDataMethods, Value};

use super::{lua_value_to_json, lua_value_to_prop, truthy};
use crate::handler::HandlerRef;
use crate::model::PageModel;
use crate::registry::Registry;

/// Lua-visible wrapper for a [`PageModel`].
pub struct ModelObject {
    model: PageModel,
}

impl ModelObject {
    pub fn new(model: PageModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &PageModel {
        &self.model
    }
}

impl UserData for ModelObject {
    fn add_fields<F: mlua::UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_set("title", |_, this, value: Value| {
            this.model.set_title(lua_value_to_prop(&value)?);
            Ok(())
        });
        fields.add_field_method_set("entries", |_, this, value: Value| {
            this.model.set_entries(lua_value_to_prop(&value)?);
            Ok(())
        });
        fields.add_field_method_set("type", |_, this, value: Value| {
            this.model.set_type(lua_value_to_prop(&value)?);
            Ok(())
        });
        fields.add_field_method_set("url", |_, this, value: Value| {
            this.model.set_url(lua_value_to_prop(&value)?);
            Ok(())
        });
        fields.add_field_method_set("loading", |_, this, value: Value| {
            this.model.set_loading(truthy(&value));
            Ok(())
        });
        fields.add_field_method_set("paginator", |lua, this, value: Value| {
            this.model.set_paginator(lua, value)?;
            Ok(())
        });

        fields.add_field_method_get("args", |_, this| Ok(this.model.args().to_vec()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        // page:appendItem(url, type, metadata?)
        methods.add_method(
            "appendItem",
            |lua, this, (url, kind, meta): (String, String, Option<Table>)| {
                let meta = match meta {
                    Some(t) => Some(lua_value_to_json(lua, Value::Table(t))?),
                    None => None,
                };
                this.model.append_item(&url, &kind, meta.as_ref());
                Ok(())
            },
        );

        // page:appendModel(type, metadata?) -> model
        methods.add_method(
            "appendModel",
            |lua, this, (kind, meta): (String, Option<Table>)| -> mlua::Result<AnyUserData> {
                let meta = match meta {
                    Some(t) => Some(lua_value_to_json(lua, Value::Table(t))?),
                    None => None,
                };
                let nested = this.model.append_model(&kind, meta.as_ref());
                lua.create_userdata(ModelObject::new(nested))
            },
        );
    }
}

/// Lua-visible plugin object handed to a module chunk.
pub struct PluginObject {
    module: String,
    registry: Arc<Registry>,
}

impl PluginObject {
    pub fn new(module: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            module: module.into(),
            registry,
        }
    }
}

impl UserData for PluginObject {
    fn add_fields<F: mlua::UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| Ok(this.module.clone()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        // plugin:addRoute(pattern, handler)
        methods.add_method("addRoute", |lua, this, (pattern, handler): (String, Value)| {
            let label = format!("{}:{}", this.module, pattern);
            let handler = HandlerRef::root(lua, handler, label)?;
            this.registry.add_route(&this.module, &pattern, handler)?;
            Ok(())
        });

        // plugin:addSearcher(handler)
        methods.add_method("addSearcher", |lua, this, handler: Value| {
            let label = format!("{}:search", this.module);
            let handler = HandlerRef::root(lua, handler, label)?;
            this.registry.add_searcher(&this.module, handler);
            Ok(())
        });
    }
}
