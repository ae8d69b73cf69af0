//! Navigation backend: page allocation and synthetic locations.

use std::collections::HashMap;

use parking_lot::RwLock;
use skein_prop::{Prop, PropTree};
use uuid::Uuid;

/// Scheme prefix for locations minted by [`PropNavigator::make_location`].
pub const PROP_LOCATION_PREFIX: &str = "skein:prop:";

/// A request to open a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub view: Option<String>,
    pub close_on_back: bool,
}

/// A page allocated by a navigator.
///
/// `root` is the page's subtree. It is unattached, so releasing the last
/// handle to it tears the page down.
#[derive(Debug, Clone)]
pub struct NavPage {
    pub url: String,
    pub view: Option<String>,
    pub close_on_back: bool,
    pub root: Prop,
}

/// The navigation layer the runtime hands pages to.
#[cfg_attr(test, mockall::automock)]
pub trait Navigator: Send + Sync {
    /// Allocate a page for a request.
    fn open_page(&self, request: &PageRequest) -> NavPage;

    /// Allocate a fresh location that resolves to `item`.
    fn make_location(&self, item: &Prop) -> String;
}

/// Navigator backed directly by a [`PropTree`].
pub struct PropNavigator {
    tree: PropTree,
    locations: RwLock<HashMap<String, Prop>>,
}

impl PropNavigator {
    pub fn new(tree: PropTree) -> Self {
        Self {
            tree,
            locations: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a location minted by [`Navigator::make_location`]. Locations
    /// whose node has been destroyed no longer resolve.
    pub fn resolve(&self, location: &str) -> Option<Prop> {
        self.locations
            .read()
            .get(location)
            .filter(|prop| !prop.is_zombie())
            .cloned()
    }

    /// Number of locations still tracked.
    pub fn location_count(&self) -> usize {
        self.locations.read().len()
    }

    fn prune(&self) {
        let stale: Vec<Prop> = {
            let mut locations = self.locations.write();
            let dead: Vec<String> = locations
                .iter()
                .filter(|(_, prop)| prop.is_zombie())
                .map(|(location, _)| location.clone())
                .collect();
            dead.iter().filter_map(|l| locations.remove(l)).collect()
        };
        if !stale.is_empty() {
            tracing::trace!("Pruned {} stale locations", stale.len());
        }
    }
}

impl Navigator for PropNavigator {
    fn open_page(&self, request: &PageRequest) -> NavPage {
        let root = self.tree.create(None, Some("page"));
        tracing::debug!("Opened page for {}", request.url);
        NavPage {
            url: request.url.clone(),
            view: request.view.clone(),
            close_on_back: request.close_on_back,
            root,
        }
    }

    fn make_location(&self, item: &Prop) -> String {
        self.prune();
        let location = format!("{}{}", PROP_LOCATION_PREFIX, Uuid::new_v4());
        self.locations
            .write()
            .insert(location.clone(), item.clone());
        location
    }
}
