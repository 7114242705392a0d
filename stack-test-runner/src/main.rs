use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stack_test_runner::config::RunnerConfig;
use stack_test_runner::runner::TestRunner;

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

    let config = RunnerConfig::parse();

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(config: RunnerConfig) -> anyhow::Result<i32> {
    let interrupt = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            interrupt.cancel();
        }
    });

    let outcome = TestRunner::new(config)
        .run(interrupt)
        .await
        .context("test job did not complete")?;
    Ok(outcome.exit_code())
}
