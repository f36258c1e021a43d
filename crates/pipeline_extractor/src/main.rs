use clap::Parser;
use pipeline_extractor::{ExtractorConfiguration, ExtractorPlugin};
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_stage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "extractor")?;
    let config: ExtractorConfiguration = load_config(&args)?;
    let runtime = PluginRuntime::new(config.pipeline.clone());
    run_stage(runtime, ExtractorPlugin::new(config)?).await
}
