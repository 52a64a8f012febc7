use anyhow::{Context, Result};
use hivelink_authz::api::{start_api_server, AppState};
use hivelink_authz::config::Config;
use hivelink_pipeline::config::LoggingConfig;
use hivelink_pipeline::directory::PgDeviceDirectory;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging)?;

    info!(
        service = "hivelink-authz",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Hivelink Authorization Service"
    );

    config.validate()?;

    let directory = PgDeviceDirectory::connect(&config.database)
        .await
        .context("Failed to connect to device directory")?;

    let state = AppState {
        directory: Arc::new(directory),
        vhost: Arc::from(config.policy.vhost.as_str()),
    };

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Authorization service stopped");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
