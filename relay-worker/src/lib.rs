//! Worker process for relay-queue.
//!
//! Applications register their job types and hand the registry to [`serve`],
//! which loads the queue configuration, runs one [`Worker`] on the chosen
//! connection and stops it on `SIGINT` / `SIGTERM`.
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = relay_worker::Args::parse();
//!     relay_worker::init_tracing(args.log_format);
//!
//!     let registry = JobRegistry::new().with::<SendWelcomeEmail>()?;
//!     relay_worker::serve(args, Arc::new(registry)).await
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use relay_queue::{JobRegistry, QueueConfig, QueueManager, StopOutcome, Worker};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "database")]
use relay_queue::{ClaimReaper, DatabaseOptions, DatabaseQueue, QueueBackend, SystemClock};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Worker process options; each overrides the loaded configuration
#[derive(Parser, Debug)]
#[command(name = "relay-worker")]
#[command(author, version, about = "Process jobs from a relay-queue connection")]
pub struct Args {
    /// JSON queue configuration; `RELAY_*` environment variables otherwise
    #[arg(long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Connection to consume
    #[arg(long)]
    pub connection: Option<String>,

    /// Queues to poll, in priority order
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Seconds to wait for the job in flight on shutdown
    #[arg(long)]
    pub shutdown_timeout: Option<f64>,

    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Args {
    /// Load the configuration and apply the command-line overrides
    pub fn queue_config(&self) -> anyhow::Result<QueueConfig> {
        let mut config = match &self.config {
            Some(path) => QueueConfig::from_json_file(path)
                .with_context(|| format!("Failed to load queue configuration from {}", path.display()))?,
            None => QueueConfig::from_env().context("Failed to load queue configuration from the environment")?,
        };

        if let Some(connection) = &self.connection {
            config.worker.connection = Some(connection.clone());
        }
        if !self.queues.is_empty() {
            config.worker.queues = self.queues.clone();
        }
        if let Some(secs) = self.shutdown_timeout {
            config.worker.shutdown_timeout =
                Duration::try_from_secs_f64(secs).context("Invalid --shutdown-timeout")?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Install the global subscriber; `RUST_LOG` wins over the `info` default
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Run a worker until a shutdown signal arrives
///
/// Refuses to start without registered job types: every claimed job would
/// fail as unknown and be deleted.
pub async fn serve(args: Args, registry: Arc<JobRegistry>) -> anyhow::Result<()> {
    if registry.registered_names().is_empty() {
        anyhow::bail!("No job types are registered; refusing to consume the queue");
    }

    let config = args.queue_config()?;
    let worker_config = config.worker.clone();

    #[cfg(feature = "database")]
    let reaper = spawn_reaper(&config, registry.clone()).await?;

    let manager = Arc::new(QueueManager::new(config, registry));
    let worker = Worker::new(manager.clone(), worker_config);

    info!(
        "Starting worker on connection `{}` (queues: {})",
        worker.connection(),
        worker.queues().join(", ")
    );

    let mut running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    tokio::select! {
        finished = &mut running => {
            finished.context("Worker task panicked")??;
            warn!("Worker exited before a shutdown signal");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping worker...");
            match worker.stop().await {
                StopOutcome::Graceful => info!("Worker stopped gracefully"),
                StopOutcome::Forced => warn!("Worker was stopped forcefully; the job in flight was abandoned"),
            }
            if !running.is_finished() {
                running.abort();
            }
        }
    }

    #[cfg(feature = "database")]
    {
        if let Some(reaper) = reaper {
            reaper.abort();
        }
    }

    manager.disconnect_all().await;
    Ok(())
}

/// Start a claim reaper when the worker consumes a database connection with a claim timeout
#[cfg(feature = "database")]
async fn spawn_reaper(
    config: &QueueConfig,
    registry: Arc<JobRegistry>,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    let name = config
        .worker
        .connection
        .as_deref()
        .unwrap_or(&config.default_connection);

    let Some(connection) = config.connections.get(name).filter(|c| c.driver == "database") else {
        return Ok(None);
    };

    let options: DatabaseOptions = connection.options()?;
    if options.claim_timeout().is_none() {
        return Ok(None);
    }

    let queue = DatabaseQueue::from_options(&options, None, registry, Arc::new(SystemClock))?;
    queue.connect().await?;
    Ok(Some(ClaimReaper::new(queue).spawn()))
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
