use clap::Parser;
use pipeline_loadbalancer::{LoadBalancer, LoadBalancerConfiguration};
use pipeline_plugin::{
    PluginRuntime,
    logger::init_tracing,
    plugin_helpers::{PluginArgs, cancel_on_shutdown, load_config},
};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PluginArgs::parse();
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "loadbalancer")?;
    let config: LoadBalancerConfiguration = load_config(&args)?;
    let runtime = PluginRuntime::new(config.pipeline.clone());
    cancel_on_shutdown(runtime.cancellation_token());
    if let Err(e) = LoadBalancer::new(config).run(runtime).await {
        error!(error = %e, "load balancer failed");
        return Err(e.into());
    }
    Ok(())
}
