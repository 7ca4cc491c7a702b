use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use mqtt_logger::adapters::{self, MqttAdapter, RumqttSession};
use mqtt_logger::config::AppConfig;
use mqtt_logger::error::{LoggerError, EXIT_CONFIG_ERROR, EXIT_INTERNAL_ERROR, EXIT_SUCCESS};
use mqtt_logger::service::connection::ConnectionManager;
use mqtt_logger::service::lifecycle::{report_liveness, Lifecycle};
use mqtt_logger::service::{run_logger, BatchSettings, RunSettings};
use mqtt_logger::telemetry;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Parser, Debug)]
#[command(author, version, about = "Records every message on the configured MQTT topics to a durable sink")]
struct Args {
    /// Config file (YAML, TOML or JSON). Environment variables take precedence over it.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging is not up yet, so configuration errors go to stderr.
    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(e) = telemetry::init_telemetry("mqtt-logger", &config.log_level, config.otlp_endpoint.as_deref()) {
        eprintln!("Failed to initialize telemetry: {:#}", e);
        return ExitCode::from(EXIT_INTERNAL_ERROR);
    }
    info!("Starting MQTT Logger...");
    info!("Broker: {:?}", config.broker);

    if let Some(addr) = config.metrics_addr {
        let installed = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .idle_timeout(metrics_util::MetricKindMask::ALL, Some(Duration::from_secs(60)))
            .install();
        match installed {
            Ok(()) => info!("Prometheus Metrics listening on {}", addr),
            Err(e) => {
                error!("Failed to install Prometheus recorder on {}: {}", addr, e);
                telemetry::shutdown_telemetry();
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        }
    }

    let code = match run(config).await {
        Ok(persisted) => {
            info!("MQTT Logger stopped cleanly after persisting {} records.", persisted);
            EXIT_SUCCESS
        }
        Err(e) => {
            error!("MQTT Logger stopped: {}", e);
            e.exit_code()
        }
    };

    telemetry::shutdown_telemetry();
    ExitCode::from(code)
}

async fn run(config: AppConfig) -> Result<u64, LoggerError> {
    info!("Opening output {} ({:?})...", config.output_target, config.output_format);
    let sink = adapters::open_sink(&config.output_target, config.output_format).await?;

    let (client, eventloop) = MqttAdapter::build(&config.broker, config.connect_timeout)
        .map_err(|e| LoggerError::Config(format!("{:#}", e)))?;
    let acker = Arc::new(MqttAdapter::new(client.clone()));
    let session = RumqttSession::new(client, eventloop);

    let lifecycle = Arc::new(Lifecycle::new());
    let liveness = tokio::spawn(report_liveness(lifecycle.watch_connection(), lifecycle.watch_process()));
    let connection = ConnectionManager::new(Box::new(session), config.reconnect, config.connect_timeout, lifecycle.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let settings = RunSettings {
        batch: BatchSettings {
            batch_size: config.batch_size,
            batch_window: config.batch_window,
            max_retries: config.persist_max_retries,
            retry_delay: config.persist_retry_delay,
        },
        channel_capacity: config.channel_capacity,
        drain_timeout: DRAIN_TIMEOUT,
    };
    let result = run_logger(connection, config.subscriptions, sink, acker, settings, lifecycle, shutdown_rx).await;

    if tokio::time::timeout(Duration::from_secs(1), liveness).await.is_err() {
        warn!("Liveness reporter did not stop.");
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown Signal Received (SIGINT)..."),
        _ = terminate => info!("Shutdown Signal Received (SIGTERM)..."),
    }
}
