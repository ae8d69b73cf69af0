//! Execution trampoline: one detached worker thread per page model.
//!
//! A worker invokes the model's handler once, then, while a paginator is
//! installed and the output collection is alive, idles on the model's
//! courier and runs the paginator for every append request it receives.
//! Lua is only entered for the duration of a call; the wait itself happens
//! with the interpreter released.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use mlua::{AnyUserData, IntoLuaMulti, Lua, Value, Variadic};
use serde::Serialize;
use skein_prop::{ExtEvent, PropEvent};

use crate::error::{PluginError, PluginResult};
use crate::handler::HandlerRef;
use crate::lua::ModelObject;
use crate::model::PageModel;

/// How a worker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Invoke the model's handler, then service pagination.
    Invoke,
    /// Only service pagination (a paginator installed on a model that had
    /// no worker of its own).
    Idle,
}

/// Counters shared by all workers of a runtime.
#[derive(Debug, Default)]
pub struct WorkerStats {
    live: AtomicUsize,
    idle: AtomicUsize,
    invocations: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Workers currently running.
    pub live: usize,
    /// Workers blocked waiting for pagination requests.
    pub idle: usize,
    /// Handler and paginator invocations so far.
    pub invocations: u64,
    /// Invocations that raised a Lua error.
    pub errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            live: self.live.load(Ordering::SeqCst),
            idle: self.idle.load(Ordering::SeqCst),
            invocations: self.invocations.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }
}

/// Scope of one worker. Dropping it records the worker's exit.
struct ExecContext {
    stats: Arc<WorkerStats>,
}

impl ExecContext {
    fn enter(stats: Arc<WorkerStats>) -> Self {
        stats.live.fetch_add(1, Ordering::SeqCst);
        Self { stats }
    }

    /// Mark the worker as blocked outside the interpreter until the guard
    /// is dropped.
    fn suspend(&self) -> Suspended<'_> {
        self.stats.idle.fetch_add(1, Ordering::SeqCst);
        Suspended { stats: &self.stats }
    }
}

impl Drop for ExecContext {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a worker as idle-waiting on its courier. It only keeps the counts;
/// no Lua lock is held while it is alive.
struct Suspended<'a> {
    stats: &'a WorkerStats,
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        self.stats.idle.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Start a detached worker for `model` running in `lua`, which must be the
/// state its handler and paginator are rooted in.
pub(crate) fn spawn(lua: &Lua, model: PageModel, entry: Entry) -> PluginResult<()> {
    let config = &model.env().workers;
    let name = format!("{}-{}", config.thread_name, model.id());
    let mut builder = thread::Builder::new().name(name);
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }

    // Live from here until the worker's scope ends.
    let ctx = ExecContext::enter(Arc::clone(&model.env().stats));
    model.claim_worker();
    let claimed = model.clone();
    let lua = lua.clone();
    match builder.spawn(move || run(lua, model, entry, ctx)) {
        Ok(_) => Ok(()),
        Err(e) => {
            claimed.release_worker();
            Err(PluginError::Spawn(e.to_string()))
        }
    }
}

fn run(lua: Lua, model: PageModel, entry: Entry, ctx: ExecContext) {
    let id = model.id();
    tracing::debug!("Worker for model {} started ({:?})", id, entry);
    serve(&lua, model, entry, &ctx);
    tracing::debug!("Worker for model {} finished", id);
}

fn serve(lua: &Lua, model: PageModel, entry: Entry, ctx: &ExecContext) {
    let object = match lua.create_userdata(ModelObject::new(model.clone())) {
        Ok(object) => object,
        Err(e) => {
            tracing::warn!("Model {} could not be exposed to Lua: {}", model.id(), e);
            model.retire_worker();
            return;
        }
    };

    if entry == Entry::Invoke {
        if let Some(handler) = model.handler() {
            match handler_args(lua, &object, model.args()) {
                Ok(args) => invoke(&model, handler, args),
                Err(e) => tracing::warn!("Arguments for model {} rejected: {}", model.id(), e),
            }
        }
    }

    while !model.retire_worker() {
        let Some(courier) = model.courier() else {
            break;
        };
        let event = {
            let _suspended = ctx.suspend();
            courier.wait()
        };

        match event {
            Some(PropEvent::Destroyed) | None => model.stop(),
            Some(PropEvent::External(ExtEvent::AppendRequest)) => {
                if let Some(paginator) = model.paginator() {
                    invoke(&model, &paginator, object.clone());
                }
            }
            Some(PropEvent::External(other)) => {
                tracing::trace!("Model {} ignoring event {:?}", model.id(), other);
            }
        }
    }
}

fn handler_args(
    lua: &Lua,
    object: &AnyUserData,
    args: &[String],
) -> mlua::Result<Variadic<Value>> {
    let mut values = Vec::with_capacity(args.len() + 1);
    values.push(Value::UserData(object.clone()));
    for arg in args {
        values.push(Value::String(lua.create_string(arg)?));
    }
    Ok(Variadic::from_iter(values))
}

/// Call `handler`. Lua errors are reported and counted; the worker carries on.
fn invoke(model: &PageModel, handler: &HandlerRef, args: impl IntoLuaMulti) {
    let stats = &model.env().stats;
    stats.invocations.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = handler.call::<()>(args) {
        stats.errors.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            "Handler '{}' failed for model {}: {}",
            handler.label(),
            model.id(),
            e
        );
    }
}
