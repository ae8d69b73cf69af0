//! Opaque, unforgeable handles for registrations.
//!
//! Handles are the only way to reference a registered route or searcher.
//! Constructors are private to the crate, so only the tables below can mint
//! them, and ids come from a per-table generation counter so a removed
//! handle never aliases a later registration.

use std::collections::HashMap;

use crate::handler::HandlerRef;
use crate::pattern::RoutePattern;

// =============================================================================
// Opaque Handle Types
// =============================================================================

/// Opaque handle to a registered route.
///
/// Can only be created by [`RouteTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle(u64);

impl RouteHandle {
    fn new(id: u64) -> Self {
        Self(id)
    }

    fn id(&self) -> u64 {
        self.0
    }
}

/// Opaque handle to a registered searcher.
///
/// Can only be created by [`SearcherTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearcherHandle(u64);

impl SearcherHandle {
    fn new(id: u64) -> Self {
        Self(id)
    }

    fn id(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// Registrations
// =============================================================================

/// A route: a compiled pattern and the handler it dispatches to.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: RoutePattern,
    pub handler: HandlerRef,
}

/// A search handler.
#[derive(Debug, Clone)]
pub struct Searcher {
    pub handler: HandlerRef,
}

// =============================================================================
// Tables
// =============================================================================

/// Routes kept in dispatch order.
///
/// `order` is sorted by ascending priority. A new route goes after every
/// route of equal priority, so ties resolve in registration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    items: HashMap<u64, (String, Route)>, // (module, route)
    order: Vec<u64>,
    generation: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route and return its handle.
    pub fn insert(&mut self, module: &str, route: Route) -> RouteHandle {
        self.generation += 1;
        let id = self.generation;
        let priority = route.pattern.priority();
        let position = self
            .order
            .iter()
            .position(|other| {
                self.items
                    .get(other)
                    .is_some_and(|(_, r)| r.pattern.priority() > priority)
            })
            .unwrap_or(self.order.len());
        self.order.insert(position, id);
        self.items.insert(id, (module.to_string(), route));
        RouteHandle::new(id)
    }

    pub fn get(&self, handle: RouteHandle) -> Option<&Route> {
        self.items.get(&handle.id()).map(|(_, r)| r)
    }

    /// Find a route by its anchored pattern text.
    pub fn find_pattern(&self, anchored: &str) -> Option<RouteHandle> {
        self.items
            .iter()
            .find(|(_, (_, r))| r.pattern.as_str() == anchored)
            .map(|(&id, _)| RouteHandle::new(id))
    }

    pub fn remove(&mut self, handle: RouteHandle) -> Option<Route> {
        self.order.retain(|&id| id != handle.id());
        self.items.remove(&handle.id()).map(|(_, r)| r)
    }

    /// Iterate in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = (RouteHandle, &str, &Route)> {
        self.order.iter().filter_map(move |&id| {
            self.items
                .get(&id)
                .map(|(module, r)| (RouteHandle::new(id), module.as_str(), r))
        })
    }

    pub fn handles_for_module(&self, module: &str) -> Vec<RouteHandle> {
        self.iter()
            .filter(|(_, m, _)| *m == module)
            .map(|(h, _, _)| h)
            .collect()
    }

    /// Remove every route registered by `module`.
    pub fn remove_module(&mut self, module: &str) -> Vec<Route> {
        let ids: Vec<u64> = self
            .items
            .iter()
            .filter(|(_, (m, _))| m == module)
            .map(|(&id, _)| id)
            .collect();

        self.order.retain(|id| !ids.contains(id));
        ids.into_iter()
            .filter_map(|id| self.items.remove(&id).map(|(_, r)| r))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Searchers in registration order.
#[derive(Debug, Default)]
pub struct SearcherTable {
    items: HashMap<u64, (String, Searcher)>,
    order: Vec<u64>,
    generation: u64,
}

impl SearcherTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: &str, searcher: Searcher) -> SearcherHandle {
        self.generation += 1;
        let id = self.generation;
        self.items.insert(id, (module.to_string(), searcher));
        self.order.push(id);
        SearcherHandle::new(id)
    }

    pub fn get(&self, handle: SearcherHandle) -> Option<&Searcher> {
        self.items.get(&handle.id()).map(|(_, s)| s)
    }

    pub fn remove(&mut self, handle: SearcherHandle) -> Option<Searcher> {
        self.order.retain(|&id| id != handle.id());
        self.items.remove(&handle.id()).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SearcherHandle, &str, &Searcher)> {
        self.order.iter().filter_map(move |&id| {
            self.items
                .get(&id)
                .map(|(module, s)| (SearcherHandle::new(id), module.as_str(), s))
        })
    }

    pub fn remove_module(&mut self, module: &str) -> Vec<Searcher> {
        let ids: Vec<u64> = self
            .items
            .iter()
            .filter(|(_, (m, _))| m == module)
            .map(|(&id, _)| id)
            .collect();

        self.order.retain(|id| !ids.contains(id));
        ids.into_iter()
            .filter_map(|id| self.items.remove(&id).map(|(_, s)| s))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
