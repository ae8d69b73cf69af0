//! `skein`: load Lua page plugins, open a location or run a search, and print
//! the resulting page tree as JSON.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueHint};
use serde_json::{json, Value};
use skein_core::{ConfigError, RuntimeConfig};
use skein_plugin_api::{PageRuntime, PluginError, PRIORITY_LITERAL};
use skein_prop::{ExtEvent, PropTree};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(
    name = "skein",
    version,
    about = "Run Lua page plugins and print the pages they build",
    long_about = None,
    arg_required_else_help = true,
    after_help = r#"EXAMPLES
  $ skein routes
  $ skein --plugin radio.lua open radio:station:42
  $ skein open radio:browse --pages 2
  $ skein search "jazz""#
)]
struct Cli {
    #[arg(
        long,
        help = "Configuration file (default: <config dir>/skein/config.toml)",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "plugin",
        help = "Load an extra plugin file (repeatable)",
        value_hint = ValueHint::FilePath
    )]
    plugins: Vec<PathBuf>,

    #[arg(long, help = "Do not load the configured plugin directory")]
    no_plugin_dir: bool,

    #[arg(long, help = "Log every property tree change at debug level")]
    trace_tree: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Open a location and print its page")]
    Open {
        location: String,

        #[arg(long, help = "View hint passed to the navigator")]
        view: Option<String>,

        #[arg(long, default_value_t = 0, help = "Append requests to send after the first batch")]
        pages: u32,

        #[arg(
            long,
            default_value_t = 5000,
            help = "Longest time to wait for handlers to go quiet, in milliseconds"
        )]
        settle_ms: u64,
    },

    #[command(about = "Run every searcher for a query and print the results")]
    Search {
        query: String,

        #[arg(
            long,
            default_value_t = 5000,
            help = "Longest time to wait for searchers to go quiet, in milliseconds"
        )]
        settle_ms: u64,
    },

    #[command(about = "List routes in dispatch order")]
    Routes,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("No route for '{0}'")]
    NoRoute(String),

    #[error("Failed to render output: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("skein: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.filter);

    match run(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("skein: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => RuntimeConfig::load_default(),
    }
}

/// Logs go to stderr so stdout carries only JSON.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();
}

fn run(cli: Cli, config: &RuntimeConfig) -> Result<(), CliError> {
    let runtime = PageRuntime::from_config(config);
    if cli.trace_tree {
        spawn_tree_tracer(runtime.tree());
    }

    if !cli.no_plugin_dir {
        if let Some(dir) = config.plugin_dir() {
            let loaded = runtime.load_plugin_dir(&dir)?;
            tracing::info!("Loaded {} plugins from {}", loaded.len(), dir.display());
        }
    }
    for path in &cli.plugins {
        runtime.load_module_file(path)?;
    }

    match cli.command {
        Command::Routes => {
            let routes: Vec<Value> = runtime
                .routes()
                .into_iter()
                .map(|r| {
                    let priority = if r.priority == PRIORITY_LITERAL {
                        Value::Null
                    } else {
                        json!(r.priority)
                    };
                    json!({ "module": r.module, "pattern": r.pattern, "priority": priority })
                })
                .collect();
            print_json(&Value::Array(routes))
        }

        Command::Open {
            location,
            view,
            pages,
            settle_ms,
        } => {
            let page = runtime
                .open(&location, view.as_deref())?
                .ok_or_else(|| CliError::NoRoute(location.clone()))?;
            let budget = Duration::from_millis(settle_ms);
            settle(&runtime, budget);

            if let Some(nodes) = page.root.find("model.nodes") {
                for n in 0..pages {
                    if runtime.workers().idle == 0 {
                        tracing::info!("No paginator left after {} extra pages", n);
                        break;
                    }
                    let before = runtime.workers().invocations;
                    nodes.send_event(ExtEvent::AppendRequest);
                    wait_until(budget, || {
                        let w = runtime.workers();
                        w.invocations > before && w.live == w.idle
                    });
                }
            }

            print_json(&json!({
                "url": page.url,
                "view": page.view,
                "page": page.root.to_json(),
                "workers": runtime.workers(),
            }))
        }

        Command::Search { query, settle_ms } => {
            let target = runtime.tree().create(None, Some("search"));
            let started = runtime.search(&target, &query);
            settle(&runtime, Duration::from_millis(settle_ms));

            print_json(&json!({
                "query": query,
                "searchers": started,
                "results": target.to_json(),
                "workers": runtime.workers(),
            }))
        }
    }
}

/// Wait until every worker has either finished or is idling for more
/// requests.
fn settle(runtime: &PageRuntime, budget: Duration) {
    wait_until(budget, || {
        let w = runtime.workers();
        w.live == w.idle
    });
}

fn wait_until(budget: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            tracing::warn!("Gave up waiting for handlers after {:?}", budget);
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_tree_tracer(tree: &PropTree) {
    let mut events = tree.observe();
    let spawned = thread::Builder::new()
        .name("tree-trace".to_string())
        .spawn(move || loop {
            match events.blocking_recv() {
                Ok(event) => tracing::debug!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Tree tracer skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Tree tracing disabled: {}", e);
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
