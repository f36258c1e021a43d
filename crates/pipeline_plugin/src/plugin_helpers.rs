use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::{HasPipelineConfig, load_stage_config},
    plugin::{PipelinePlugin, SourcePlugin},
    plugin_runtime::PluginRuntime,
};

// -----------------------------------------------------------------------------
// Command line
// -----------------------------------------------------------------------------

/// Arguments shared by every stage binary.
#[derive(Parser, Debug, Clone)]
pub struct PluginArgs {
    /// Path to the stage configuration
    #[arg(default_value = "./config.yaml")]
    pub config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write daily rolling log files here
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Loads and verifies the stage configuration named on the command line.
pub fn load_config<C>(args: &PluginArgs) -> anyhow::Result<C>
where
    C: DeserializeOwned + HasPipelineConfig,
{
    load_stage_config(&args.config)
        .inspect_err(|e| {
            error!(config = %args.config.display(), error = %e, "cannot load configuration")
        })
        .with_context(|| format!("loading {}", args.config.display()))
}

/// Cancels `token` on ctrl-c.
pub fn cancel_on_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            token.cancel();
        }
    })
}

pub async fn run_stage<P: PipelinePlugin>(runtime: PluginRuntime, plugin: P) -> anyhow::Result<()> {
    let id = runtime.config().id.clone();
    cancel_on_shutdown(runtime.cancellation_token());
    if let Err(e) = runtime.run(plugin).await {
        error!(%id, error = %e, "stage failed");
        return Err(e.into());
    }
    Ok(())
}

pub async fn run_source_stage<S: SourcePlugin>(
    runtime: PluginRuntime,
    source: S,
) -> anyhow::Result<()> {
    let id = runtime.config().id.clone();
    cancel_on_shutdown(runtime.cancellation_token());
    if let Err(e) = runtime.run_source(source).await {
        error!(%id, error = %e, "source failed");
        return Err(e.into());
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// JSON paths
// -----------------------------------------------------------------------------

/// `"a.b.c"` becomes `["a", "b", "c"]`.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Parses `input` as a JSON object. Anything else yields `None`.
pub fn parse_object(input: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str(input) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Child object `name` of `object`, created empty when missing. `None` when
/// the existing value is not an object.
pub fn find_or_create_child<'a>(
    object: &'a mut Map<String, Value>,
    name: &str,
) -> Option<&'a mut Map<String, Value>> {
    object
        .entry(name.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

/// Walks `path`, creating missing objects on the way.
pub fn ensure_parent<'a>(
    root: &'a mut Map<String, Value>,
    path: &[&str],
) -> Option<&'a mut Map<String, Value>> {
    let mut current = root;
    for part in path {
        current = find_or_create_child(current, part)?;
    }
    Some(current)
}

/// Walks `path` through existing objects only.
pub fn find_parent_mut<'a>(
    root: &'a mut Map<String, Value>,
    path: &[&str],
) -> Option<&'a mut Map<String, Value>> {
    let mut current = root;
    for part in path {
        current = current.get_mut(*part)?.as_object_mut()?;
    }
    Some(current)
}

pub fn find_value<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let parts = split_path(path);
    let (field, parents) = parts.split_last()?;
    let mut current = root;
    for part in parents {
        current = current.get(*part)?.as_object()?;
    }
    current.get(*field)
}
