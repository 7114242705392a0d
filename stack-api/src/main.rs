use envconfig::Envconfig;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use stack_api::config::Config;
use stack_api::database::Database;
use stack_api::server::serve;
use stack_common::metrics::setup_metrics_recorder;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("received shutdown signal");
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");

    // DEBUG selects human readable output with span events, otherwise one
    // JSON object per line.
    let log_layer = {
        let base_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true);

        if *config.debug {
            base_layer
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_ansi(true)
                .with_filter(env_filter())
                .boxed()
        } else {
            base_layer.json().with_filter(env_filter()).boxed()
        }
    };
    tracing_subscriber::registry().with(log_layer).init();

    // Nothing is bound until the database answers, so the port opening is a
    // signal that the API can serve.
    let database = match Database::connect(&config).await {
        Ok(database) => database,
        Err(e) => {
            error!(error = %e, "database never became ready");
            std::process::exit(1);
        }
    };

    let recorder = setup_metrics_recorder().expect("failed to install metrics recorder");
    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .expect("could not bind port");

    if let Err(e) = serve(config, database, recorder, listener, shutdown()).await {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
    info!("stopped");
}
