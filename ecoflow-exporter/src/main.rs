/**
 * ECOFLOW EXPORTER - process entry point
 *
 * ROLE: wires config, credential exchange, MQTT session, watchdog, processing loop
 * and the scrape endpoint together.
 *
 * EXIT CODES: 0 on SIGTERM / Ctrl-C, 1 on bad configuration or failed authentication.
 */

use anyhow::{Context, Result};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ecoflow_exporter::auth::EcoflowApi;
use ecoflow_exporter::config::{ExporterConfig, LogLevel};
use ecoflow_exporter::health::HealthTracker;
use ecoflow_exporter::http::{self, AppState};
use ecoflow_exporter::metrics::MetricRegistry;
use ecoflow_exporter::mqtt::{ConnectionManager, EventHandlers};
use ecoflow_exporter::queue::ObservationQueue;
use ecoflow_exporter::watchdog::{ConnectionState, Watchdog, WatchdogSettings, RECONNECT_BUDGET};
use ecoflow_exporter::worker::Worker;

fn init_logging() {
    // RUST_LOG wins over LOG_LEVEL when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LogLevel::from_env().as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    // .env is optional
    dotenvy::dotenv().ok();
    init_logging();

    let config = match ExporterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: ExporterConfig) -> Result<()> {
    let device = config.device();

    let api = EcoflowApi::new(&config.access_key, &config.secret_key, &config.api_host);
    let params = api
        .authorize(&device)
        .await
        .context("EcoFlow developer API authentication failed")?;

    // shared state between MQTT, watchdog, worker and HTTP
    let queue = ObservationQueue::new();
    let connection = Arc::new(ConnectionState::new());
    let health_tracker = HealthTracker::new();

    let handlers = EventHandlers::new(
        queue.clone(),
        connection.clone(),
        health_tracker.clone(),
        params.topic.clone(),
    );
    let manager = Arc::new(ConnectionManager::new(params, handlers));

    // a failed first connect is left to the watchdog
    match tokio::time::timeout(RECONNECT_BUDGET, manager.connect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Initial MQTT connection failed: {}", e),
        Err(_) => warn!(
            "Initial MQTT connection timed out after {} seconds",
            RECONNECT_BUDGET.as_secs()
        ),
    }
    // guarantees a timestamp so the watchdog fires if nothing ever arrives
    if connection.last_message().is_none() {
        connection.touch();
    }

    let watchdog = Watchdog::new(
        manager.clone(),
        connection.clone(),
        health_tracker.clone(),
        WatchdogSettings::new(config.mqtt_timeout),
    );
    tokio::spawn(watchdog.run());

    let registry = Registry::new();
    let metrics = MetricRegistry::new(registry.clone(), &device.display_name)
        .context("failed to register status metrics")?;
    let worker = Worker::new(queue, metrics, device.clone(), config.collecting_interval);
    tokio::spawn(worker.run());

    let app = http::build_router(AppState {
        registry,
        health_tracker,
        device,
        connection,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.exporter_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Exporter listening on http://{}/metrics", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("HTTP server stopped")?;
        }
        signal = shutdown_signal() => {
            info!("Received {}, exiting", signal);
            manager.disconnect();
        }
    }
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = tokio::signal::ctrl_c() => "SIGINT",
            },
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}
