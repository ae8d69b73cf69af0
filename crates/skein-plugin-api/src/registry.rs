//! Route and searcher registry.
//!
//! One registry is owned by each runtime instance. Both tables live behind a
//! single lock: registration and revocation take it for writing, while
//! dispatch takes a read-consistent snapshot and releases it before any
//! handler runs.

use parking_lot::RwLock;

use crate::error::{PluginError, PluginResult};
use crate::handle::{Route, RouteHandle, RouteTable, Searcher, SearcherHandle, SearcherTable};
use crate::handler::HandlerRef;
use crate::pattern::RoutePattern;

/// The route selected for a location.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: RouteHandle,
    pub module: String,
    /// Anchored pattern text.
    pub pattern: String,
    pub handler: HandlerRef,
    /// Participating capture groups, in order.
    pub args: Vec<String>,
}

/// A route as listed for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub route: RouteHandle,
    pub module: String,
    pub pattern: String,
    pub priority: usize,
}

/// What [`Registry::revoke_all`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revoked {
    pub routes: usize,
    pub searchers: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    routes: RouteTable,
    searchers: SearcherTable,
}

/// Registry of routes and searchers for all loaded modules.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Routes
    // =========================================================================

    /// Register a route for `module`.
    ///
    /// The duplicate check runs on the anchored text before compilation; a
    /// failed registration leaves the registry untouched.
    pub fn add_route(
        &self,
        module: &str,
        pattern: &str,
        handler: HandlerRef,
    ) -> PluginResult<RouteHandle> {
        let anchored = RoutePattern::anchor(pattern);
        let mut state = self.state.write();

        if state.routes.find_pattern(&anchored).is_some() {
            return Err(PluginError::DuplicatePattern(anchored));
        }
        let pattern = RoutePattern::compile(&anchored)?;

        tracing::info!(
            "Module '{}' added route {} (priority {})",
            module,
            pattern.as_str(),
            pattern.priority()
        );
        Ok(state.routes.insert(module, Route { pattern, handler }))
    }

    /// Unregister a route. Returns false for a stale handle.
    pub fn remove_route(&self, handle: RouteHandle) -> bool {
        let removed = self.state.write().routes.remove(handle);
        if let Some(route) = &removed {
            tracing::debug!("Removed route {}", route.pattern.as_str());
        }
        removed.is_some()
    }

    /// Select the first route, in dispatch order, matching `location`.
    pub fn resolve(&self, location: &str) -> Option<RouteMatch> {
        let state = self.state.read();
        let found = state.routes.iter().find_map(|(route, module, r)| {
            r.pattern.captures(location).map(|args| RouteMatch {
                route,
                module: module.to_string(),
                pattern: r.pattern.as_str().to_string(),
                handler: r.handler.clone(),
                args,
            })
        });
        found
    }

    /// All routes in dispatch order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.state
            .read()
            .routes
            .iter()
            .map(|(route, module, r)| RouteInfo {
                route,
                module: module.to_string(),
                pattern: r.pattern.as_str().to_string(),
                priority: r.pattern.priority(),
            })
            .collect()
    }

    pub fn route_count(&self) -> usize {
        self.state.read().routes.len()
    }

    // =========================================================================
    // Searchers
    // =========================================================================

    pub fn add_searcher(&self, module: &str, handler: HandlerRef) -> SearcherHandle {
        tracing::info!("Module '{}' added searcher", module);
        self.state
            .write()
            .searchers
            .insert(module, Searcher { handler })
    }

    pub fn remove_searcher(&self, handle: SearcherHandle) -> bool {
        self.state.write().searchers.remove(handle).is_some()
    }

    /// Snapshot of every searcher with its module, in registration order.
    pub fn searchers(&self) -> Vec<(SearcherHandle, String, HandlerRef)> {
        self.state
            .read()
            .searchers
            .iter()
            .map(|(h, module, s)| (h, module.to_string(), s.handler.clone()))
            .collect()
    }

    pub fn searcher_count(&self) -> usize {
        self.state.read().searchers.len()
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// Unregister everything `module` registered.
    ///
    /// Workers already running keep their own handler references, so this is
    /// safe while requests from the module are still in flight.
    pub fn revoke_all(&self, module: &str) -> Revoked {
        let (routes, searchers) = {
            let mut state = self.state.write();
            (
                state.routes.remove_module(module),
                state.searchers.remove_module(module),
            )
        };
        let revoked = Revoked {
            routes: routes.len(),
            searchers: searchers.len(),
        };
        tracing::debug!(
            "Revoked {} routes and {} searchers of module '{}'",
            revoked.routes,
            revoked.searchers,
            module
        );
        revoked
    }

    /// Routes and searchers currently owned by `module`.
    pub fn module_entries(&self, module: &str) -> Revoked {
        let state = self.state.read();
        Revoked {
            routes: state.routes.handles_for_module(module).len(),
            searchers: state
                .searchers
                .iter()
                .filter(|(_, m, _)| *m == module)
                .count(),
        }
    }
}
