use clap::Parser;
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_source_stage},
};
use pipeline_reader::{ReaderConfiguration, ReaderPlugin};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "reader")?;
    let config: ReaderConfiguration = load_config(&args)?;
    let reader = ReaderPlugin::open(&config).await?;
    run_source_stage(PluginRuntime::new(config.pipeline), reader).await
}
