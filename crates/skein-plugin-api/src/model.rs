//! Page models.
//!
//! A page model is the per-request object a handler writes its output
//! through. It owns handles to the nodes of one page (or one nested model)
//! and the courier its worker idles on. Ownership is shared between the
//! worker and the Lua-side object; the model is torn down when both have
//! let go.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Lua, Value};
use parking_lot::Mutex;
use skein_core::WorkerConfig;
use skein_prop::{Courier, Prop, PropError, PropTree, PropValue, SubFlags, Subscription};

use crate::error::PluginResult;
use crate::handler::HandlerRef;
use crate::navigator::Navigator;
use crate::worker::{self, Entry, WorkerStats};

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators shared by every model of a runtime.
pub(crate) struct ModelEnv {
    pub tree: PropTree,
    pub navigator: Arc<dyn Navigator>,
    pub stats: Arc<WorkerStats>,
    pub workers: WorkerConfig,
}

/// Node handles a model writes to. Each one is optional; writes to an
/// absent node are ignored.
#[derive(Debug, Default, Clone)]
pub struct ModelNodes {
    pub loading: Option<Prop>,
    /// The output collection.
    pub nodes: Option<Prop>,
    pub kind: Option<Prop>,
    pub title: Option<Prop>,
    pub entries: Option<Prop>,
    pub url: Option<Prop>,
}

/// Shared handle to a page model.
#[derive(Clone)]
pub struct PageModel {
    inner: Arc<ModelInner>,
}

struct ModelInner {
    subscription: Option<Subscription>,
    courier: Option<Courier>,
    id: u64,
    args: Vec<String>,
    handler: Option<HandlerRef>,
    paginator: Mutex<Option<HandlerRef>>,
    nodes: ModelNodes,
    run: AtomicBool,
    worker: AtomicBool,
    env: Arc<ModelEnv>,
}

impl PageModel {
    /// Create a model. When an output collection is present the model
    /// watches it for destruction and append requests.
    pub(crate) fn new(
        env: Arc<ModelEnv>,
        handler: Option<HandlerRef>,
        args: Vec<String>,
        nodes: ModelNodes,
    ) -> Self {
        let id = NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed);
        let (courier, subscription) = match &nodes.nodes {
            Some(collection) => {
                let courier = Courier::new(format!("model-{}", id));
                let sub =
                    collection.subscribe(&courier, SubFlags::TRACK_DESTROY | SubFlags::EXT_EVENTS);
                (Some(courier), Some(sub))
            }
            None => (None, None),
        };

        Self {
            inner: Arc::new(ModelInner {
                subscription,
                courier,
                id,
                args,
                handler,
                paginator: Mutex::new(None),
                nodes,
                run: AtomicBool::new(true),
                worker: AtomicBool::new(false),
                env,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Positional arguments passed to the handler.
    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn handler(&self) -> Option<&HandlerRef> {
        self.inner.handler.as_ref()
    }

    pub fn nodes(&self) -> &ModelNodes {
        &self.inner.nodes
    }

    pub(crate) fn env(&self) -> &Arc<ModelEnv> {
        &self.inner.env
    }

    pub(crate) fn courier(&self) -> Option<&Courier> {
        self.inner.courier.as_ref()
    }

    /// Number of handles sharing this model.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Append a leaf item to the output collection. If the collection has
    /// been destroyed the item is discarded.
    pub fn append_item(&self, url: &str, kind: &str, metadata: Option<&serde_json::Value>) {
        let Some(collection) = &self.inner.nodes.nodes else {
            return;
        };
        let item = collection.tree().create(None, None);
        if let Some(meta) = metadata {
            item.create_child("metadata").set_json(meta);
        }
        item.create_child("url").set(url);
        item.create_child("type").set(kind);

        if let Err(e) = item.set_parent(collection) {
            tracing::trace!("Discarding item {} of model {}: {}", url, self.id(), e);
            item.destroy();
        }
    }

    /// Append a nested model under a freshly allocated location and return
    /// it for configuration.
    pub fn append_model(&self, kind: &str, metadata: Option<&serde_json::Value>) -> PageModel {
        let env = Arc::clone(&self.inner.env);
        let parent = self.inner.nodes.nodes.as_ref();

        let item = env.tree.create(None, None);
        let location = env.navigator.make_location(&item);

        let meta = item.create_child("metadata");
        if let Some(value) = metadata {
            meta.set_json(value);
        }
        item.create_child("url").set(location.as_str());

        let nodes = ModelNodes {
            nodes: Some(item.create_child("nodes")),
            kind: Some(item.create_child("type")),
            title: Some(meta.create_child("title")),
            entries: Some(meta.create_child("entries")),
            ..ModelNodes::default()
        };
        let child = PageModel::new(env, None, Vec::new(), nodes);
        child.set_type(kind);

        let attached = match parent {
            Some(collection) => item.set_parent(collection),
            None => Err(PropError::ParentDestroyed),
        };
        if let Err(e) = attached {
            tracing::trace!("Discarding nested model {} of model {}: {}", location, self.id(), e);
            item.destroy();
        }
        child
    }

    pub fn set_title(&self, value: impl Into<PropValue>) {
        write(&self.inner.nodes.title, value);
    }

    pub fn set_entries(&self, value: impl Into<PropValue>) {
        write(&self.inner.nodes.entries, value);
    }

    pub fn set_type(&self, value: impl Into<PropValue>) {
        write(&self.inner.nodes.kind, value);
    }

    pub fn set_url(&self, value: impl Into<PropValue>) {
        write(&self.inner.nodes.url, value);
    }

    pub fn set_loading(&self, on: bool) {
        write(&self.inner.nodes.loading, on);
    }

    // =========================================================================
    // Pagination
    // =========================================================================

    /// Install the continuation called on every append request. Replaces any
    /// earlier one. A model with no worker gets one that idles for requests.
    pub fn set_paginator(&self, lua: &Lua, value: Value) -> PluginResult<()> {
        let paginator = HandlerRef::root(lua, value, format!("paginator of model {}", self.id()))?;
        let needs_worker = {
            let mut slot = self.inner.paginator.lock();
            *slot = Some(paginator);
            self.inner.courier.is_some() && !self.inner.worker.swap(true, Ordering::SeqCst)
        };
        if needs_worker {
            worker::spawn(lua, self.clone(), Entry::Idle)?;
        }
        Ok(())
    }

    pub fn paginator(&self) -> Option<HandlerRef> {
        self.inner.paginator.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.load(Ordering::SeqCst)
    }

    /// Clear the run flag. The worker exits at its next wake-up.
    pub fn stop(&self) {
        self.inner.run.store(false, Ordering::SeqCst);
    }

    pub(crate) fn claim_worker(&self) {
        self.inner.worker.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_worker(&self) {
        self.inner.worker.store(false, Ordering::SeqCst);
    }

    /// Decide whether the worker should keep idling. When it should not,
    /// the paginator is unrooted and the worker slot is given up in the same
    /// critical section [`set_paginator`](Self::set_paginator) uses.
    pub(crate) fn retire_worker(&self) -> bool {
        let mut slot = self.inner.paginator.lock();
        if slot.is_some() && self.is_running() && self.inner.courier.is_some() {
            return false;
        }
        let released = slot.take();
        self.inner.worker.store(false, Ordering::SeqCst);
        drop(slot);
        drop(released);
        true
    }
}

fn write(node: &Option<Prop>, value: impl Into<PropValue>) {
    if let Some(prop) = node {
        prop.set(value);
    }
}

impl fmt::Debug for PageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageModel")
            .field("id", &self.inner.id)
            .field("args", &self.inner.args)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for ModelInner {
    fn drop(&mut self) {
        tracing::trace!("Page model {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::navigator::MockNavigator;
    use serde_json::json;
    use skein_prop::{ExtEvent, PropEvent};

    fn env_with(tree: &PropTree, navigator: MockNavigator) -> Arc<ModelEnv> {
        Arc::new(ModelEnv {
            tree: tree.clone(),
            navigator: Arc::new(navigator),
            stats: Arc::new(WorkerStats::default()),
            workers: WorkerConfig::default(),
        })
    }

    fn page_nodes(root: &Prop) -> ModelNodes {
        let meta = root.create_child("metadata");
        ModelNodes {
            loading: Some(root.create_child("loading")),
            nodes: Some(root.create_child("nodes")),
            kind: Some(root.create_child("type")),
            title: Some(meta.create_child("title")),
            entries: Some(meta.create_child("entries")),
            url: Some(root.create_child("url")),
        }
    }

    fn page_model(tree: &PropTree, root: &Prop, navigator: MockNavigator) -> PageModel {
        PageModel::new(env_with(tree, navigator), None, vec![], page_nodes(root))
    }

    fn bare_model(tree: &PropTree) -> PageModel {
        PageModel::new(
            env_with(tree, MockNavigator::new()),
            None,
            vec![],
            ModelNodes::default(),
        )
    }

    #[test]
    fn test_setters_write_held_nodes() {
        let tree = PropTree::new(16);
        let root = tree.create(None, None);
        let model = page_model(&tree, &root, MockNavigator::new());

        model.set_title("Title");
        model.set_entries(12i64);
        model.set_type("directory");
        model.set_url("test:canonical");
        model.set_loading(true);

        assert_eq!(root.find("metadata.title").unwrap().value(), PropValue::from("Title"));
        assert_eq!(root.find("metadata.entries").unwrap().value(), PropValue::Int(12));
        assert_eq!(root.find("type").unwrap().value(), PropValue::from("directory"));
        assert_eq!(root.find("url").unwrap().value(), PropValue::from("test:canonical"));
        assert_eq!(root.find("loading").unwrap().value(), PropValue::Int(1));
    }

    #[test]
    fn test_setters_without_nodes_are_noops() {
        let tree = PropTree::new(16);
        let model = bare_model(&tree);
        model.set_title("ignored");
        model.set_loading(false);
        model.append_item("x", "y", None);
        assert!(model.courier().is_none());
    }

    #[test]
    fn test_append_item() {
        let tree = PropTree::new(16);
        let root = tree.create(None, None);
        let model = page_model(&tree, &root, MockNavigator::new());

        model.append_item("test:1", "video", Some(&json!({"title": "One", "duration": 30})));
        model.append_item("test:2", "audio", None);

        let items = root.find("nodes").unwrap().children();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].find("url").unwrap().value(), PropValue::from("test:1"));
        assert_eq!(items[0].find("metadata.title").unwrap().value(), PropValue::from("One"));
        assert_eq!(items[0].find("metadata.duration").unwrap().value(), PropValue::Int(30));
        assert_eq!(items[1].find("type").unwrap().value(), PropValue::from("audio"));
        assert!(items[1].child("metadata").is_none());
    }

    #[test]
    fn test_append_item_after_detach_is_discarded() {
        let tree = PropTree::new(16);
        let root = tree.create(None, None);
        let model = page_model(&tree, &root, MockNavigator::new());
        let nodes = root.find("nodes").unwrap();
        nodes.destroy();
        let before = tree.len();

        model.append_item("test:late", "video", Some(&json!({"title": "late"})));

        assert!(nodes.children().is_empty());
        assert_eq!(tree.len(), before);
    }

    #[test]
    fn test_nodes_destroyed_reaches_courier() {
        let tree = PropTree::new(16);
        let root = tree.create(None, None);
        let model = page_model(&tree, &root, MockNavigator::new());

        root.find("nodes").unwrap().send_event(ExtEvent::AppendRequest);
        root.destroy();

        let courier = model.courier().unwrap();
        assert_eq!(courier.try_next(), Some(PropEvent::External(ExtEvent::AppendRequest)));
        assert_eq!(courier.try_next(), Some(PropEvent::Destroyed));
    }

    #[test]
    fn test_append_model_builds_nested_subtree() {
        let tree = PropTree::new(16);
        let root = tree.create(None, None);

        let mut navigator = MockNavigator::new();
        navigator
            .expect_make_location()
            .times(1)
            .returning(|_| "mock:nested:1".to_string());
        let model = page_model(&tree, &root, navigator);

        model.set_title("outer");
        let nested = model.append_model("directory", Some(&json!({"icon": "folder"})));
        nested.set_title("inner");
        nested.append_item("test:leaf", "video", None);

        let items = root.find("nodes").unwrap().children();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.find("url").unwrap().value(), PropValue::from("mock:nested:1"));
        assert_eq!(item.find("type").unwrap().value(), PropValue::from("directory"));
        assert_eq!(item.find("metadata.icon").unwrap().value(), PropValue::from("folder"));
        assert_eq!(item.find("metadata.title").unwrap().value(), PropValue::from("inner"));
        assert_eq!(item.find("nodes").unwrap().children().len(), 1);

        assert_eq!(root.find("metadata.title").unwrap().value(), PropValue::from("outer"));
        assert_ne!(nested.nodes().nodes, model.nodes().nodes);
        assert!(nested.courier().is_some());
    }

    #[test]
    fn test_append_model_under_destroyed_collection_is_discarded() {
        let lua = Lua::new();
        let tree = PropTree::new(16);
        let root = tree.create(None, None);

        let mut navigator = MockNavigator::new();
        navigator
            .expect_make_location()
            .times(1)
            .returning(|_| "mock:nested:late".to_string());
        let model = page_model(&tree, &root, navigator);
        let nodes = root.find("nodes").unwrap();
        nodes.destroy();

        let nested = model.append_model("directory", None);
        nested.set_title("ignored");
        assert!(nodes.children().is_empty());
        assert!(nested.nodes().nodes.as_ref().unwrap().is_zombie());

        let func = lua.create_function(|_, ()| Ok(())).unwrap();
        nested.set_paginator(&lua, Value::Function(func)).unwrap();
        let stats = Arc::clone(&nested.env().stats);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while stats.snapshot().live > 0 {
            assert!(std::time::Instant::now() < deadline, "nested worker did not exit");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(nested.paginator().is_none());
        assert_eq!(stats.snapshot().invocations, 0);
    }

    #[test]
    fn test_set_paginator_rejects_non_function() {
        let lua = Lua::new();
        let tree = PropTree::new(16);
        let model = bare_model(&tree);

        let err = model.set_paginator(&lua, Value::Integer(3)).unwrap_err();
        assert!(matches!(err, PluginError::NotAFunction { got: "integer" }));
        assert!(model.paginator().is_none());
    }

    #[test]
    fn test_set_paginator_replaces_previous() {
        let lua = Lua::new();
        // No output collection: the paginator is stored but no worker starts.
        let tree = PropTree::new(16);
        let model = bare_model(&tree);

        let first = lua.create_function(|_, ()| Ok(1)).unwrap();
        let second = lua.create_function(|_, ()| Ok(2)).unwrap();
        model.set_paginator(&lua, Value::Function(first)).unwrap();
        model.set_paginator(&lua, Value::Function(second)).unwrap();

        let result: i64 = model.paginator().unwrap().call(()).unwrap();
        assert_eq!(result, 2);
        assert_eq!(model.env().stats.snapshot().live, 0);
    }

    #[test]
    fn test_retire_worker_releases_paginator() {
        let lua = Lua::new();
        let tree = PropTree::new(16);
        let model = bare_model(&tree);
        let func = lua.create_function(|_, ()| Ok(())).unwrap();
        model.set_paginator(&lua, Value::Function(func)).unwrap();

        assert!(model.retire_worker());
        assert!(model.paginator().is_none());
    }
}
