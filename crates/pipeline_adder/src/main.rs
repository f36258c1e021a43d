use clap::Parser;
use pipeline_adder::{
    AdderConfiguration, AdderPlugin,
    watcher::{DEFAULT_POLL_INTERVAL, watch_config},
};
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_stage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "adder")?;
    let config: AdderConfiguration = load_config(&args)?;
    let runtime = PluginRuntime::new(config.pipeline.clone());
    let (plugin, updates) = AdderPlugin::watching(config);
    let watcher = watch_config(
        args.config.clone(),
        updates,
        DEFAULT_POLL_INTERVAL,
        runtime.cancellation_token(),
    )?;
    let result = run_stage(runtime, plugin).await;
    watcher.abort();
    result
}
