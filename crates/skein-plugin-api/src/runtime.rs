//! The page runtime: one registry, one property tree and one Lua state per
//! loaded module.
//!
//! `PageRuntime` loads plugin modules, dispatches locations and search
//! queries to their handlers and starts a worker per resulting page model.
//! Workers of different modules run in parallel; workers of the same module
//! take turns in its Lua state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::Lua;
use parking_lot::RwLock;
use skein_core::RuntimeConfig;
use skein_prop::{Prop, PropTree};

use crate::error::{PluginError, PluginResult};
use crate::lua::PluginObject;
use crate::model::{ModelEnv, ModelNodes, PageModel};
use crate::navigator::{NavPage, Navigator, PageRequest, PropNavigator};
use crate::registry::{Registry, Revoked, RouteInfo};
use crate::worker::{self, Entry, WorkerSnapshot, WorkerStats};

/// A loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    /// File the module was loaded from, if any.
    pub path: Option<PathBuf>,
}

struct LoadedModule {
    info: ModuleInfo,
    lua: Lua,
}

pub struct PageRuntime {
    registry: Arc<Registry>,
    env: Arc<ModelEnv>,
    modules: RwLock<BTreeMap<String, LoadedModule>>,
}

impl PageRuntime {
    /// Create a runtime with an explicit tree and navigator.
    pub fn new(config: &RuntimeConfig, tree: PropTree, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            env: Arc::new(ModelEnv {
                tree,
                navigator,
                stats: Arc::new(WorkerStats::default()),
                workers: config.workers.clone(),
            }),
            modules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a runtime with a fresh tree and a [`PropNavigator`] over it.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let tree = PropTree::new(config.tree.event_capacity);
        let navigator = Arc::new(PropNavigator::new(tree.clone()));
        Self::new(config, tree, navigator)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tree(&self) -> &PropTree {
        &self.env.tree
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.env.navigator
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// Run a module chunk in a fresh Lua state. The chunk receives its plugin
    /// object as `...`.
    ///
    /// Loading a name that is already loaded replaces it. If the chunk fails,
    /// everything it registered is revoked.
    pub fn load_module(&self, name: &str, source: &str) -> PluginResult<()> {
        self.install(name, source, None)
    }

    /// Load a module from a file, named after the file stem.
    pub fn load_module_file(&self, path: &Path) -> PluginResult<String> {
        let source = fs::read_to_string(path).map_err(|e| PluginError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.install(&name, &source, Some(path.to_path_buf()))?;
        Ok(name)
    }

    /// Load every `*.lua` file in `dir`, in file name order.
    ///
    /// A missing directory loads nothing. Modules that fail to load are
    /// logged and skipped; the names of the loaded ones are returned.
    pub fn load_plugin_dir(&self, dir: &Path) -> PluginResult<Vec<String>> {
        if !dir.is_dir() {
            tracing::debug!("Plugin directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(dir).map_err(|e| PluginError::Io {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "lua"))
            .collect();
        files.sort();

        let mut loaded = Vec::new();
        for file in files {
            match self.load_module_file(&file) {
                Ok(name) => loaded.push(name),
                Err(e) => tracing::warn!("Failed to load plugin {}: {}", file.display(), e),
            }
        }
        Ok(loaded)
    }

    /// Unload a module: revoke all its registrations and reclaim unrooted
    /// handlers. Workers already running for it finish normally.
    pub fn unload_module(&self, name: &str) -> PluginResult<Revoked> {
        let Some(module) = self.modules.write().remove(name) else {
            return Err(PluginError::ModuleNotFound(name.to_string()));
        };
        let revoked = self.registry.revoke_all(name);
        module.lua.expire_registry_values();
        tracing::info!(
            "Unloaded module '{}' ({} routes, {} searchers)",
            name,
            revoked.routes,
            revoked.searchers
        );
        Ok(revoked)
    }

    /// Loaded modules, sorted by name.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.modules
            .read()
            .values()
            .map(|m| m.info.clone())
            .collect()
    }

    fn install(&self, name: &str, source: &str, path: Option<PathBuf>) -> PluginResult<()> {
        if let Some(old) = self.modules.write().remove(name) {
            tracing::info!("Reloading module '{}'", name);
            self.registry.revoke_all(name);
            old.lua.expire_registry_values();
        }

        let lua = Lua::new();
        let plugin = lua.create_userdata(PluginObject::new(name, Arc::clone(&self.registry)))?;
        if let Err(e) = lua.load(source).set_name(name).call::<()>(plugin) {
            let revoked = self.registry.revoke_all(name);
            tracing::warn!(
                "Module '{}' failed to load, revoked {} routes and {} searchers",
                name,
                revoked.routes,
                revoked.searchers
            );
            return Err(e.into());
        }

        let entries = self.registry.module_entries(name);
        tracing::info!(
            "Loaded module '{}' ({} routes, {} searchers)",
            name,
            entries.routes,
            entries.searchers
        );
        self.modules.write().insert(
            name.to_string(),
            LoadedModule {
                info: ModuleInfo {
                    name: name.to_string(),
                    path,
                },
                lua,
            },
        );
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Open `location`. Returns `None` when no route matches.
    ///
    /// The page is laid out as
    /// `page/{url, model/{loading, nodes, type, metadata/{title, entries}}}`
    /// and the handler runs on its own worker. Dropping the returned page
    /// tears it down and ends the worker.
    ///
    /// Only routes are consulted. Locations minted for nested models
    /// (`skein:prop:...`) are not routes; presenting them is up to the
    /// navigator, e.g. [`PropNavigator::resolve`].
    pub fn open(&self, location: &str, view: Option<&str>) -> PluginResult<Option<NavPage>> {
        let Some(route) = self.registry.resolve(location) else {
            tracing::debug!("No route for {}", location);
            return Ok(None);
        };
        tracing::debug!(
            "Routing {} to {} of module '{}' with {} args",
            location,
            route.pattern,
            route.module,
            route.args.len()
        );

        let page = self.env.navigator.open_page(&PageRequest {
            url: location.to_string(),
            view: view.map(str::to_string),
            close_on_back: false,
        });

        let model = page.root.create_child("model");
        let metadata = model.create_child("metadata");
        let nodes = ModelNodes {
            loading: Some(model.create_child("loading")),
            nodes: Some(model.create_child("nodes")),
            kind: Some(model.create_child("type")),
            title: Some(metadata.create_child("title")),
            entries: Some(metadata.create_child("entries")),
            url: Some(page.root.create_child("url")),
        };

        let lua = route.handler.lua().clone();
        let model = PageModel::new(Arc::clone(&self.env), Some(route.handler), route.args, nodes);
        model.set_loading(true);
        worker::spawn(&lua, model, Entry::Invoke)?;
        Ok(Some(page))
    }

    /// Run every searcher for `query`. All of them append into the `nodes`
    /// child of `target`. Returns the number of searchers started; one that
    /// cannot get a worker is logged and skipped.
    pub fn search(&self, target: &Prop, query: &str) -> usize {
        let nodes = target.create_child("nodes");
        let searchers = self.registry.searchers();
        tracing::debug!("Searching '{}' across {} searchers", query, searchers.len());

        let mut started = 0;
        for (_, module, handler) in &searchers {
            let model = PageModel::new(
                Arc::clone(&self.env),
                Some(handler.clone()),
                vec![query.to_string()],
                ModelNodes {
                    nodes: Some(nodes.clone()),
                    ..ModelNodes::default()
                },
            );
            tracing::trace!("Search model {} for module '{}'", model.id(), module);
            match worker::spawn(handler.lua(), model, Entry::Invoke) {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!("Searcher of module '{}' not started: {}", module, e),
            }
        }
        started
    }

    /// Routes in dispatch order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.registry.routes()
    }

    pub fn workers(&self) -> WorkerSnapshot {
        self.env.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigator::{MockNavigator, PROP_LOCATION_PREFIX};
    use skein_prop::{ExtEvent, PropValue};
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn runtime() -> (PageRuntime, Arc<PropNavigator>) {
        let config = RuntimeConfig::default();
        let tree = PropTree::new(64);
        let navigator = Arc::new(PropNavigator::new(tree.clone()));
        let runtime = PageRuntime::new(&config, tree, navigator.clone());
        (runtime, navigator)
    }

    fn value(root: &Prop, path: &str) -> PropValue {
        root.find(path).map(|p| p.value()).unwrap_or_default()
    }

    #[test]
    fn test_open_without_route() {
        let (rt, _) = runtime();
        assert!(rt.open("nothing:here", None).unwrap().is_none());
        assert_eq!(rt.workers().invocations, 0);
    }

    #[test]
    fn test_open_runs_handler_with_args() {
        let (rt, _) = runtime();
        rt.load_module(
            "echo",
            r#"
            local plugin = ...
            plugin:addRoute("echo:(\\w+):(\\d+)", function(page, word, num)
                page.type = "directory"
                page.title = word .. "/" .. num
                page.entries = tonumber(num)
                page.url = "echo:canonical"
                page.loading = false
            end)
            "#,
        )
        .unwrap();

        let page = rt.open("ECHO:hello:7", Some("list")).unwrap().unwrap();
        assert_eq!(page.view.as_deref(), Some("list"));
        assert!(!page.close_on_back);

        wait_for("handler", || rt.workers().live == 0);
        let root = &page.root;
        assert_eq!(value(root, "model.metadata.title"), PropValue::from("hello/7"));
        assert_eq!(value(root, "model.metadata.entries"), PropValue::Int(7));
        assert_eq!(value(root, "model.type"), PropValue::from("directory"));
        assert_eq!(value(root, "url"), PropValue::from("echo:canonical"));
        assert_eq!(value(root, "model.loading"), PropValue::Int(0));
    }

    #[test]
    fn test_loading_set_before_handler_runs() {
        let (rt, _) = runtime();
        rt.load_module(
            "slow",
            r#"
            local plugin = ...
            plugin:addRoute("slow:", function(page) end)
            "#,
        )
        .unwrap();

        let page = rt.open("slow:", None).unwrap().unwrap();
        assert_eq!(value(&page.root, "model.loading"), PropValue::Int(1));
    }

    #[test]
    fn test_pagination_in_order_then_termination() {
        let (rt, _) = runtime();
        rt.load_module(
            "pager",
            r#"
            local plugin = ...
            plugin:addRoute("pager:list", function(page)
                local n = 0
                page.paginator = function()
                    n = n + 1
                    page:appendItem("pager:item:" .. n, "video")
                end
                page:appendItem("pager:item:0", "video")
                page.loading = false
            end)
            "#,
        )
        .unwrap();

        let page = rt.open("pager:list", None).unwrap().unwrap();
        let nodes = page.root.find("model.nodes").unwrap();
        wait_for("first batch", || {
            nodes.children().len() == 1 && rt.workers().idle == 1
        });

        nodes.send_event(ExtEvent::AppendRequest);
        nodes.send_event(ExtEvent::AppendRequest);
        wait_for("two pages", || nodes.children().len() == 3);

        let urls: Vec<PropValue> = nodes
            .children()
            .iter()
            .map(|item| value(item, "url"))
            .collect();
        assert_eq!(
            urls,
            vec![
                PropValue::from("pager:item:0"),
                PropValue::from("pager:item:1"),
                PropValue::from("pager:item:2"),
            ]
        );

        nodes.destroy();
        wait_for("worker exit", || rt.workers().live == 0);
        assert_eq!(rt.workers().invocations, 3);
        assert_eq!(rt.workers().errors, 0);
    }

    #[test]
    fn test_dropping_page_ends_idle_worker() {
        let (rt, _) = runtime();
        rt.load_module(
            "pager",
            r#"
            local plugin = ...
            plugin:addRoute("pager:", function(page)
                page.paginator = function() end
            end)
            "#,
        )
        .unwrap();

        let page = rt.open("pager:", None).unwrap().unwrap();
        wait_for("idle", || rt.workers().idle == 1);
        drop(page);
        wait_for("worker exit", || rt.workers().live == 0);
        assert_eq!(rt.workers().invocations, 1);
    }

    #[test]
    fn test_handler_error_is_counted() {
        let (rt, _) = runtime();
        rt.load_module(
            "broken",
            r#"
            local plugin = ...
            plugin:addRoute("broken:", function(page) error("boom") end)
            "#,
        )
        .unwrap();

        let _page = rt.open("broken:", None).unwrap().unwrap();
        wait_for("worker exit", || rt.workers().live == 0);
        assert_eq!(rt.workers().errors, 1);
    }

    #[test]
    fn test_append_model_is_isolated() {
        let (rt, navigator) = runtime();
        rt.load_module(
            "tree",
            r#"
            local plugin = ...
            plugin:addRoute("tree:", function(page)
                page.title = "outer"
                local sub = page:appendModel("directory", { icon = "folder" })
                sub.title = "inner"
                sub:appendItem("tree:leaf", "video")
                page.loading = false
            end)
            "#,
        )
        .unwrap();

        let page = rt.open("tree:", None).unwrap().unwrap();
        wait_for("handler", || rt.workers().live == 0);

        let items = page.root.find("model.nodes").unwrap().children();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(value(item, "metadata.title"), PropValue::from("inner"));
        assert_eq!(value(item, "metadata.icon"), PropValue::from("folder"));
        assert_eq!(value(item, "type"), PropValue::from("directory"));
        assert_eq!(item.find("nodes").unwrap().children().len(), 1);
        assert_eq!(value(&page.root, "model.metadata.title"), PropValue::from("outer"));

        let location = value(item, "url").to_string();
        assert!(location.starts_with(PROP_LOCATION_PREFIX));
        assert_eq!(navigator.resolve(&location).as_ref(), Some(item));
        assert!(rt.open(&location, None).unwrap().is_none());
    }

    #[test]
    fn test_nested_paginator_gets_its_own_worker() {
        let (rt, _) = runtime();
        rt.load_module(
            "nested",
            r#"
            local plugin = ...
            plugin:addRoute("nested:", function(page)
                local sub = page:appendModel("directory")
                sub.paginator = function(self)
                    self:appendItem("nested:more", "video")
                end
            end)
            "#,
        )
        .unwrap();

        let page = rt.open("nested:", None).unwrap().unwrap();
        wait_for("nested idle", || {
            let w = rt.workers();
            w.live == 1 && w.idle == 1
        });

        let item = page.root.find("model.nodes").unwrap().children().remove(0);
        let sub_nodes = item.find("nodes").unwrap();
        sub_nodes.send_event(ExtEvent::AppendRequest);
        wait_for("nested page", || sub_nodes.children().len() == 1);

        drop(item);
        drop(page);
        wait_for("all workers exit", || rt.workers().live == 0);
    }

    #[test]
    fn test_search_fans_out_across_modules() {
        let (rt, _) = runtime();
        for name in ["alpha", "beta"] {
            let source = format!(
                r#"
                local plugin = ...
                plugin:addSearcher(function(page, query)
                    page:appendItem("{}:" .. query, "video")
                end)
                "#,
                name
            );
            rt.load_module(name, &source).unwrap();
        }

        let target = rt.tree().create(None, Some("search"));
        assert_eq!(rt.search(&target, "hello"), 2);

        let nodes = target.find("nodes").unwrap();
        wait_for("both searchers", || nodes.children().len() == 2);
        let mut urls: Vec<String> = nodes
            .children()
            .iter()
            .map(|item| value(item, "url").to_string())
            .collect();
        urls.sort();
        assert_eq!(urls, vec!["alpha:hello", "beta:hello"]);
    }

    #[test]
    fn test_busy_module_does_not_block_others() {
        let (rt, _) = runtime();
        rt.load_module(
            "slow",
            r#"
            local plugin = ...
            plugin:addRoute("slow:", function(page)
                local start = os.time()
                while os.time() - start < 3 do end
                page.title = "slow"
            end)
            "#,
        )
        .unwrap();
        rt.load_module(
            "fast",
            r#"
            local plugin = ...
            plugin:addRoute("fast:", function(page) page.title = "fast" end)
            "#,
        )
        .unwrap();

        let slow = rt.open("slow:", None).unwrap().unwrap();
        wait_for("slow handler to start", || rt.workers().invocations == 1);
        let fast = rt.open("fast:", None).unwrap().unwrap();

        wait_for("fast handler", || {
            value(&fast.root, "model.metadata.title") == PropValue::from("fast")
        });
        assert_eq!(value(&slow.root, "model.metadata.title"), PropValue::Void);

        wait_for("slow handler", || rt.workers().live == 0);
        assert_eq!(value(&slow.root, "model.metadata.title"), PropValue::from("slow"));
    }

    #[test]
    fn test_modules_have_separate_globals() {
        let (rt, _) = runtime();
        rt.load_module(
            "a",
            r#"
            local plugin = ...
            shared = "from a"
            plugin:addRoute("a:", function(page) page.title = tostring(shared) end)
            "#,
        )
        .unwrap();
        rt.load_module(
            "b",
            r#"
            local plugin = ...
            plugin:addRoute("b:", function(page) page.title = tostring(shared) end)
            "#,
        )
        .unwrap();

        let a = rt.open("a:", None).unwrap().unwrap();
        let b = rt.open("b:", None).unwrap().unwrap();
        wait_for("handlers", || rt.workers().live == 0);
        assert_eq!(value(&a.root, "model.metadata.title"), PropValue::from("from a"));
        assert_eq!(value(&b.root, "model.metadata.title"), PropValue::from("nil"));
    }

    #[test]
    fn test_search_skips_searchers_without_worker() {
        let mut config = RuntimeConfig::default();
        // No thread can get a stack this large.
        config.workers.stack_size = Some(usize::MAX / 2);
        let rt = PageRuntime::from_config(&config);
        rt.load_module(
            "s",
            r#"
            local plugin = ...
            plugin:addSearcher(function(page, query) page:appendItem("s:" .. query, "video") end)
            "#,
        )
        .unwrap();

        let target = rt.tree().create(None, Some("search"));
        assert_eq!(rt.search(&target, "q"), 0);
        assert_eq!(rt.workers().live, 0);
        assert!(target.find("nodes").unwrap().children().is_empty());

        rt.load_module(
            "r",
            r#"
            local plugin = ...
            plugin:addRoute("r:", function() end)
            "#,
        )
        .unwrap();
        assert!(matches!(rt.open("r:", None), Err(PluginError::Spawn(_))));
        assert_eq!(rt.workers().live, 0);
    }

    #[test]
    fn test_failed_module_leaves_nothing_behind() {
        let (rt, _) = runtime();
        let result = rt.load_module(
            "half",
            r#"
            local plugin = ...
            plugin:addRoute("half:a", function() end)
            plugin:addSearcher(function() end)
            error("abort")
            "#,
        );

        assert!(result.is_err());
        assert_eq!(rt.registry().route_count(), 0);
        assert_eq!(rt.registry().searcher_count(), 0);
        assert!(rt.modules().is_empty());
    }

    #[test]
    fn test_unload_module_revokes_only_its_entries() {
        let (rt, _) = runtime();
        rt.load_module(
            "a",
            r#"
            local plugin = ...
            plugin:addRoute("a:one", function() end)
            plugin:addRoute("a:(.*)", function() end)
            plugin:addSearcher(function() end)
            "#,
        )
        .unwrap();
        rt.load_module(
            "b",
            r#"
            local plugin = ...
            plugin:addRoute("b:one", function() end)
            "#,
        )
        .unwrap();

        let revoked = rt.unload_module("a").unwrap();
        assert_eq!(revoked, Revoked { routes: 2, searchers: 1 });
        assert!(rt.open("a:one", None).unwrap().is_none());
        assert_eq!(rt.routes().len(), 1);
        assert_eq!(rt.routes()[0].module, "b");

        assert!(matches!(
            rt.unload_module("a"),
            Err(PluginError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_unload_while_worker_idles() {
        let (rt, _) = runtime();
        rt.load_module(
            "live",
            r#"
            local plugin = ...
            plugin:addRoute("live:", function(page)
                page.paginator = function(self)
                    self:appendItem("live:more", "video")
                end
            end)
            "#,
        )
        .unwrap();

        let page = rt.open("live:", None).unwrap().unwrap();
        wait_for("idle", || rt.workers().idle == 1);
        rt.unload_module("live").unwrap();

        let nodes = page.root.find("model.nodes").unwrap();
        nodes.send_event(ExtEvent::AppendRequest);
        wait_for("paginator after unload", || nodes.children().len() == 1);

        drop(page);
        wait_for("worker exit", || rt.workers().live == 0);
    }

    #[test]
    fn test_reload_replaces_routes() {
        let (rt, _) = runtime();
        let source = r#"
            local plugin = ...
            plugin:addRoute("same:", function() end)
        "#;
        rt.load_module("m", source).unwrap();
        rt.load_module("m", source).unwrap();
        assert_eq!(rt.registry().route_count(), 1);
        assert_eq!(rt.modules().len(), 1);
    }

    #[test]
    fn test_load_plugin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut good = std::fs::File::create(dir.path().join("b_good.lua")).unwrap();
        writeln!(good, "local plugin = ...\nplugin:addRoute('good:', function() end)").unwrap();
        let mut bad = std::fs::File::create(dir.path().join("a_bad.lua")).unwrap();
        writeln!(bad, "this is not lua").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (rt, _) = runtime();
        let loaded = rt.load_plugin_dir(dir.path()).unwrap();
        assert_eq!(loaded, vec!["b_good".to_string()]);
        let expected = dir.path().join("b_good.lua");
        assert_eq!(rt.modules()[0].path.as_deref(), Some(expected.as_path()));

        let missing = rt.load_plugin_dir(&dir.path().join("missing")).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_open_uses_navigator() {
        let tree = PropTree::new(16);
        let page_tree = tree.clone();
        let mut navigator = MockNavigator::new();
        navigator
            .expect_open_page()
            .withf(|req| req.url == "mock:page" && !req.close_on_back && req.view.is_none())
            .times(1)
            .returning(move |req| NavPage {
                url: req.url.clone(),
                view: req.view.clone(),
                close_on_back: req.close_on_back,
                root: page_tree.create(None, Some("page")),
            });

        let rt = PageRuntime::new(&RuntimeConfig::default(), tree, Arc::new(navigator));
        rt.load_module(
            "mock",
            r#"
            local plugin = ...
            plugin:addRoute("mock:page", function(page) page.title = "mocked" end)
            "#,
        )
        .unwrap();

        let page = rt.open("mock:page", None).unwrap().unwrap();
        wait_for("handler", || rt.workers().live == 0);
        assert_eq!(value(&page.root, "model.metadata.title"), PropValue::from("mocked"));
    }
}
