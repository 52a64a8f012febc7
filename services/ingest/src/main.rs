//! Ingest service for the hivelink device cloud.
//!
//! Runs one worker family per process, selected by `mode` in the
//! configuration or by the first command-line argument:
//!
//! - `chopper`: decode container uploads and republish each record
//! - `pulse-traffic`: derive heartbeats from device traffic
//! - `pulse-connections`: derive heartbeats from the broker connection list
//!
//! Configuration is loaded from `config/ingest`, `/etc/hivelink/ingest` and
//! `INGEST__`-prefixed environment variables. See `config.rs`.

use anyhow::{Context, Result};
use hivelink_ingest::config::{IngestConfig, Mode};
use hivelink_ingest::{
    ChopperFactory, ConnectionPulseGenerator, ManagementClient, PulseGenerator,
    TrafficPulseGenerator,
};
use hivelink_pipeline::config::LoggingConfig;
use hivelink_pipeline::BrokerConsumer;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = IngestConfig::load().context("Failed to load configuration")?;
    if let Some(mode) = std::env::args().nth(1) {
        config.mode = mode.parse()?;
    }

    init_logging(&config.logging)?;

    info!(
        service = "hivelink-ingest",
        version = env!("CARGO_PKG_VERSION"),
        mode = ?config.mode,
        "Starting ingest service"
    );

    config.validate()?;

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(run_mode(config, shutdown.clone()));

    supervise(worker, shutdown_signal(), shutdown).await
}

/// Wait for the worker or a shutdown signal, whichever comes first.
///
/// A worker that returns before any signal (a broker or management setting
/// rejected during init, for example) ends the process with its error rather
/// than leaving it idle.
async fn supervise(
    mut worker: JoinHandle<Result<()>>,
    signal: impl Future<Output = ()>,
    shutdown: CancellationToken,
) -> Result<()> {
    let finished = tokio::select! {
        result = &mut worker => Some(result),
        _ = signal => None,
    };

    let result = match finished {
        Some(result) => {
            shutdown.cancel();
            if matches!(result, Ok(Ok(()))) {
                warn!("Ingest worker exited before shutdown was requested");
            }
            result
        }
        None => {
            info!("Initiating graceful shutdown");
            shutdown.cancel();
            worker.await
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("Ingest service stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Ingest service failed");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "Ingest worker task panicked");
            Err(e.into())
        }
    }
}

async fn run_mode(config: IngestConfig, shutdown: CancellationToken) -> Result<()> {
    match config.mode {
        Mode::Chopper => {
            let handles: Vec<_> = (0..config.chopper.workers)
                .map(|index| {
                    let factory = ChopperFactory::new(
                        config.broker.exchanges.clone(),
                        config.broker.publish.clone(),
                        config.chopper.clone(),
                    );
                    let consumer =
                        BrokerConsumer::new(config.broker.clone(), format!("chopper-{}", index), factory);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move { consumer.run(shutdown).await })
                })
                .collect();

            info!(workers = handles.len(), "Chopper workers started");
            for handle in futures::future::join_all(handles).await {
                if let Err(e) = handle {
                    warn!(error = %e, "Chopper worker task failed");
                }
            }
        }
        Mode::PulseTraffic => {
            let mut generator = TrafficPulseGenerator::new(config.broker.clone(), &config.pulse);
            generator.init().await?;
            generator.run(shutdown).await?;
        }
        // A bad management URL is fatal; an unreachable broker at startup is not,
        // the run loop keeps reconnecting.
        Mode::PulseConnections => {
            let source = Arc::new(ManagementClient::new(&config.management)?);
            let mut generator =
                ConnectionPulseGenerator::new(config.broker.clone(), &config.pulse, source);
            if let Err(e) = generator.init().await {
                // the run loop reconnects on its next tick
                warn!(error = %e, "Initial broker connection failed");
            }
            generator.run(shutdown).await?;
        }
    }
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?
        .add_directive("lapin=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_early_worker_failure_ends_process() {
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(async { Err(anyhow::anyhow!("invalid broker uri")) });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(worker, std::future::pending(), shutdown.clone()),
        )
        .await
        .expect("supervise should return once the worker fails");

        assert_eq!(result.unwrap_err().to_string(), "invalid broker uri");
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_cancels_running_worker() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let worker = tokio::spawn(async move {
            token.cancelled().await;
            Ok(())
        });

        let result = supervise(worker, std::future::ready(()), shutdown.clone()).await;
        assert!(result.is_ok());
        assert!(shutdown.is_cancelled());
    }
}
