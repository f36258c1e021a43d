use clap::Parser;
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, load_config, run_stage},
};
use pipeline_rate::{RateConfiguration, RatePlugin};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "rate")?;
    let config: RateConfiguration = load_config(&args)?;
    let plugin = RatePlugin::new(&config);
    let runtime = PluginRuntime::new(config.pipeline).with_periodic(plugin.counter());
    run_stage(runtime, plugin).await
}
