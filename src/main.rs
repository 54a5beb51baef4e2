// Overlay Agent - device client for a centrally managed overlay network
// Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use overlay_agent::config::load_settings;
use overlay_agent::instance::{InstanceConfig, InstanceRegistry, InstanceStatus, NetworkInfo};
use overlay_agent::logging;
use overlay_agent::node::get_or_create_machine_id;

/// Overlay Agent - joins this device to the overlay networks its control server assigns
#[derive(Parser, Debug)]
#[command(name = "overlay-agent", version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to ~/.overlay-agent/config.toml)
    #[arg(long, global = true, env = "OVERLAY_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register with a control server and run its networks until Ctrl-C
    Run(RunArgs),

    /// Print this device's machine id, creating it if needed
    Identity {
        /// Identity file (defaults to ~/.overlay-agent/machine_id)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Control server URL, e.g. tcp://host:11020/<organization_id>
    #[arg(long, env = "OVERLAY_AGENT_SERVER_URL")]
    server_url: String,

    /// Organization id, if not part of the URL
    #[arg(long, env = "OVERLAY_AGENT_ORGANIZATION_ID")]
    organization_id: Option<String>,

    /// Device id; the persisted machine id is used when omitted
    #[arg(long, env = "OVERLAY_AGENT_MACHINE_ID")]
    machine_id: Option<String>,

    /// Hostname reported to the server and peers
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Run(args) => run(cli.config, args).await,
        Commands::Identity { path } => show_identity(cli.config, path),
    }
}

async fn run(config_path: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let settings = load_settings(config_path.as_deref())?;
    let registry = InstanceRegistry::with_defaults(settings);

    let config = InstanceConfig {
        config_server_url: args.server_url,
        organization_id: args.organization_id,
        machine_id: args.machine_id,
        hostname: args.hostname,
    };
    let (_, instance_name) = config.resolve().context("Invalid control server settings")?;
    registry
        .start(&instance_name, config)
        .with_context(|| format!("Failed to start instance '{}'", instance_name))?;

    let mut last: Option<NetworkInfo> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {
                let info = registry.get_network_info(&instance_name);
                if info != last {
                    match &info {
                        Some(i) => tracing::info!(
                            network = %i.network_name,
                            address = %i.virtual_ipv4,
                            hostname = %i.hostname,
                            version = %i.version,
                            "Network info"
                        ),
                        None => tracing::info!("No active network"),
                    }
                    last = info;
                }
                if let Some(snapshot) = registry.status(&instance_name) {
                    if snapshot.status == InstanceStatus::Stopped {
                        let reason = snapshot.last_error.unwrap_or_else(|| "unknown".into());
                        registry.shutdown().await;
                        anyhow::bail!("Instance stopped: {}", reason);
                    }
                }
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}

fn show_identity(config_path: Option<PathBuf>, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => load_settings(config_path.as_deref())?
            .identity
            .resolve_path()
            .context("Failed to locate identity file")?,
    };
    let machine_id = get_or_create_machine_id(&path)
        .with_context(|| format!("Failed to read identity at {}", path.display()))?;
    println!("{}", machine_id);
    Ok(())
}
