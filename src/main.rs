use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hyperion::{config::PluginManagerConfiguration, manager::PluginManager};
use pipeline_plugin::{logger::init_tracing, plugin_helpers::cancel_on_shutdown};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "hyperion",
    about = "Plugin manager for hyperion log pipelines",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve registrations for a pipeline
    Run(RunArgs),

    /// Check a pipeline configuration and exit
    Validate { config: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline configuration
    #[arg(default_value = "./config.yaml")]
    config: PathBuf,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write daily rolling log files here
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let _guard = init_tracing(&args.log_level, args.log_dir.as_deref(), "hyperion")?;
            let config = match PluginManagerConfiguration::load(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    error!(config = %args.config.display(), error = %e, "cannot start plugin manager");
                    return Err(e.into());
                }
            };
            let manager = PluginManager::new(config);
            cancel_on_shutdown(manager.cancellation_token());
            manager.launch_listener().await
        }
        Commands::Validate { config } => {
            let _guard = init_tracing("info", None, "hyperion")?;
            let parsed = PluginManagerConfiguration::load(&config)?;
            let ids: Vec<_> = parsed.plugins.iter().map(|p| p.id.as_str()).collect();
            info!(pipeline = %ids.join(" -> "), "configuration is valid");
            Ok(())
        }
    }
}
