//! Page plugin runtime.
//!
//! Lua modules register **routes** (location patterns) and **searchers**.
//! Opening a location picks the best matching route, builds a page subtree
//! in the property tree and runs the route's handler on a dedicated worker.
//! Searches run every searcher, each on its own worker, into one shared
//! result collection. Handlers may install a paginator that their worker
//! keeps serving until the output collection is destroyed.
//!
//! ## Dispatch order
//!
//! A pattern's priority is the offset of its first regex metacharacter;
//! lower offsets are tried first and literal patterns come last, in
//! registration order.

pub mod error;
pub mod handle;
pub mod handler;
pub mod lua;
pub mod model;
pub mod navigator;
pub mod pattern;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use error::{PluginError, PluginResult};
pub use handle::{RouteHandle, SearcherHandle};
pub use handler::HandlerRef;
pub use model::{ModelNodes, PageModel};
pub use navigator::{NavPage, Navigator, PageRequest, PropNavigator, PROP_LOCATION_PREFIX};
pub use pattern::{RoutePattern, PRIORITY_LITERAL};
pub use registry::{Registry, Revoked, RouteInfo, RouteMatch};
pub use runtime::{ModuleInfo, PageRuntime};
pub use worker::{WorkerSnapshot, WorkerStats};
