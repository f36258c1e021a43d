use clap::Parser;
use pipeline_renamer::{RenamerConfiguration, RenamerPlugin};
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_stage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "renamer")?;
    let config: RenamerConfiguration = load_config(&args)?;
    let runtime = PluginRuntime::new(config.pipeline.clone());
    run_stage(runtime, RenamerPlugin::new(config)).await
}
