//! Worker entry point.

use tokio::signal;
use worker::Config;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    worker::telemetry::init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    worker::telemetry::install_metrics(config.metrics_addr)
        .expect("failed to install Prometheus recorder");

    // 3. Run the expiry watcher until a shutdown signal arrives
    tracing::info!(sweep_interval = ?config.sweep_interval, "starting inventory worker");
    if let Err(err) = worker::run(config, shutdown_signal()).await {
        tracing::error!(error = %err, "worker stopped with an error");
        std::process::exit(1);
    }

    tracing::info!("worker shut down gracefully");
}
