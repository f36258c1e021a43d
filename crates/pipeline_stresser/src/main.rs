use clap::Parser;
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_source_stage},
};
use pipeline_stresser::{StresserConfiguration, StresserPlugin};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "stresser")?;
    let config: StresserConfiguration = load_config(&args)?;
    let runtime = PluginRuntime::new(config.pipeline.clone());
    run_source_stage(runtime, StresserPlugin::new(config)).await
}
