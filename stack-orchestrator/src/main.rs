use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal::unix::SignalKind;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stack_common::launcher::ProcessLauncher;
use stack_common::metrics::setup_metrics_recorder;
use stack_orchestrator::config::Config;
use stack_orchestrator::descriptor::Deployment;
use stack_orchestrator::server;
use stack_orchestrator::volume::VolumeStore;

#[derive(Parser)]
#[command(version, about = "Run a deployment of supervised services", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every service in dependency order and supervise them until
    /// SIGINT or SIGTERM, then stop them in reverse order
    Up {
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,
    },

    /// Check a deployment descriptor and print its start plan
    Validate {
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,
    },

    /// Manage named volumes
    Volume {
        #[command(subcommand)]
        cmd: VolumeCommand,
    },
}

#[derive(Subcommand)]
enum VolumeCommand {
    /// List volumes
    Ls,
    /// Delete a volume and all of its data
    Rm { name: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::init_from_env().expect("failed to load configuration from env");

    let result = match cli.command {
        Commands::Up { file } => up(&config, &file).await,
        Commands::Validate { file } => validate(&file).await,
        Commands::Volume { cmd } => volume(&config, cmd).await,
    };

    if let Err(e) = result {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

async fn validate(file: &Path) -> Result<()> {
    let deployment = Deployment::load(file).await?;
    print!("{}", deployment.plan());
    Ok(())
}

async fn volume(config: &Config, cmd: VolumeCommand) -> Result<()> {
    let store = VolumeStore::new(&config.volumes_root);
    match cmd {
        VolumeCommand::Ls => {
            for name in store.list().await? {
                println!("{name}");
            }
        }
        VolumeCommand::Rm { name } => store.remove(&name).await?,
    }
    Ok(())
}

async fn up(config: &Config, file: &Path) -> Result<()> {
    let deployment = Deployment::load(file).await?;
    let recorder = setup_metrics_recorder()?;

    let statuses = server::up(
        config,
        deployment,
        Arc::new(ProcessLauncher),
        recorder,
        wait_for_shutdown_signal(),
    )
    .await?;

    for status in statuses {
        info!(
            service = %status.name,
            restarts = status.restarts,
            exit_code = ?status.last_exit_code,
            "service stopped"
        );
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
