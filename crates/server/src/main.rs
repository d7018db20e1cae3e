mod bootstrap;
mod health;
mod webhook;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use leadflow_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other wiring. An explicit
    // `--config` path must exist; otherwise the loader falls back to
    // `LEADFLOW_CONFIG` and the default lookup locations.
    let explicit = config_path_from_args();
    let config = AppConfig::load(LoadOptions {
        require_file: explicit.is_some(),
        config_path: explicit,
        ..LoadOptions::default()
    })?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config)?;

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        event_name = "system.server.started",
        bind_address = %address,
        version = env!("CARGO_PKG_VERSION"),
        "webhook listener started"
    );

    axum::serve(listener, app.router).with_graceful_shutdown(shutdown_signal()).await?;

    // Webhook dispatches run detached; give in-flight ones a drain window.
    let drain = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    info!(
        event_name = "system.server.stopping",
        drain_secs = drain.as_secs(),
        "listener closed; draining background dispatches"
    );
    tokio::time::sleep(drain).await;

    info!(event_name = "system.server.stopped", "shutdown complete");
    Ok(())
}

/// Accepts `--config <path>` or `--config=<path>` without pulling in a full
/// argument parser; everything else on the command line is ignored.
fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(
                event_name = "system.server.signal_error",
                error = %error,
                "interrupt handler unavailable"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(
                    event_name = "system.server.signal_error",
                    error = %error,
                    "terminate handler unavailable"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
