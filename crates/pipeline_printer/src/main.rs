use clap::Parser;
use pipeline_plugin::{
    PluginRuntime, StageConfiguration,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_stage},
};
use pipeline_printer::PrinterPlugin;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "printer")?;
    let config: StageConfiguration = load_config(&args)?;
    run_stage(PluginRuntime::new(config.pipeline), PrinterPlugin::default()).await
}
