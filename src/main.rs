// growerd daemon entry point

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use growerd::http::{LogBuffer, RingBufferLayer};
use growerd::{Settings, World};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Settings::parse();

    // The ring buffer layer captures everything the fmt layer prints, so
    // the HTTP log surface sees the same records as the journal.
    let logs = LogBuffer::new(settings.log_buffer);
    let filter = EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(RingBufferLayer::new(logs.clone()))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "growerd starting");

    let world = match World::build(settings, logs) {
        Ok(world) => world,
        Err(e) => {
            error!(error = %e, "Initialisation failed");
            return ExitCode::from(1);
        }
    };

    match world.run(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(1)
        }
    }
}

/// Resolves on ctrl-c or SIGTERM (systemd stop).
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
