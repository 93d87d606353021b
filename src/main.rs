//! # Telemetry Uplink
//!
//! Samples the instrumentation channels, publishes one record per publish
//! interval to the collector and keeps undelivered records for retry.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use telemetry_uplink::calibration::listener::{spawn_stdin_reader, INPUT_QUEUE_DEPTH};
use telemetry_uplink::config::{Config, LoggingConfig};
use telemetry_uplink::coordinator::Coordinator;
use telemetry_uplink::publisher::{HttpPublisher, Timeouts, Transport};
use telemetry_uplink::queue::OfflineQueue;
use telemetry_uplink::shutdown::{watch_signals, ShutdownFlag};
use telemetry_uplink::state::SharedState;

/// Configuration file used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Log file name prefix inside `logging.dir`
const LOG_FILE_PREFIX: &str = "telemetry-uplink.log";

/// Main entry point for the telemetry uplink
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up logging, then deactivate malformed channels
///    - Build the HTTP publisher and open the offline queue
///
/// 2. **Run**
///    - Sampling/publish loop on the main task
///    - Retry actor and calibration listener in the background
///    - Operator input read on its own thread
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C or SIGTERM sets the shutdown flag
///    - Every actor finishes its current step and exits
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded, the queue
/// directory cannot be created, or the HTTP client cannot be built.
///
/// # Examples
///
/// ```bash
/// INFLUXDB_TOKEN=... cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging)?;
    info!("Telemetry Uplink v{} starting...", env!("CARGO_PKG_VERSION"));

    let disabled = config.sanitize_channels();
    if disabled > 0 {
        warn!("{} channel entries were disabled or dropped", disabled);
    }
    let active = config.channels.iter().filter(|c| c.is_active()).count();
    info!("{} of {} channels active", active, config.channels.len());

    let state = Arc::new(SharedState::new(config.channels.clone()));

    let queue = OfflineQueue::open(&config.queue.dir)
        .with_context(|| format!("failed to open offline queue in {}", config.queue.dir))?
        .with_max_batch(config.queue.max_batch);
    let queue = Arc::new(queue);

    let publisher = HttpPublisher::new(
        &config.collector,
        Timeouts::for_records(&config.timing),
        Timeouts::for_batches(&config.timing),
    )
    .context("failed to create HTTP publisher")?;
    info!("Publishing to {}", publisher.write_url());
    let transport: Arc<dyn Transport> = Arc::new(publisher);

    let shutdown = ShutdownFlag::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let operator_lines = if config.calibration.enabled {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        spawn_stdin_reader(tx).context("failed to start operator input reader")?;
        Some(rx)
    } else {
        None
    };

    info!("Press Ctrl+C to exit");
    let coordinator = Coordinator::new(&config, state, queue, transport, shutdown);
    coordinator.run(operator_lines).await?;

    info!("Telemetry Uplink stopped");
    Ok(())
}

/// Install the tracing subscriber
///
/// `RUST_LOG` takes precedence over `logging.level`. When `logging.dir` is
/// set, output is also written to a daily rolling file; the returned guard
/// must be held until exit so buffered lines are flushed.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let stdout = tracing_subscriber::fmt::layer();

    match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .try_init()
                .context("failed to install logger")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .try_init()
                .context("failed to install logger")?;
            Ok(None)
        }
    }
}
