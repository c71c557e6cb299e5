use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use torque_slack::config::Config;
use torque_slack::{daemon, shutdown};

#[derive(Parser, Debug)]
#[command(name = "torque-slack")]
#[command(version)]
#[command(about = "Watch TORQUE scheduler logs and post job lifecycle notifications to Slack")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// TORQUE spool directory (overrides config and TORQUE_HOME)
    #[arg(long)]
    torque_home: Option<PathBuf>,

    /// Slack incoming-webhook URL (overrides config)
    #[arg(long)]
    webhook_url: Option<String>,

    /// Log notices instead of posting them to Slack
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(home) = args.torque_home {
        config.torque_home = home;
    }
    if let Some(url) = args.webhook_url {
        config.webhook_url = Some(url);
    }

    tracing::info!(
        torque_home = %config.torque_home.display(),
        dry_run = args.dry_run,
        "Starting torque-slack"
    );

    let token = shutdown::install_shutdown_handler();
    daemon::run(config, args.dry_run, token).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
