//! Gateway entry point
//!
//! Wires configuration, shared state, the two listeners (chargers + meter),
//! and the control loops together, then waits for a termination signal. On
//! shutdown every connected charger gets its cap restored to the learned
//! maximum before the process exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use ocpp_gateway::bridge::{GatewayServer, LinkRegistry, UpstreamTasks};
use ocpp_gateway::config::{default_config_path, AppConfig};
use ocpp_gateway::control::commands::send_charging_profile;
use ocpp_gateway::control::{DemandControlLoop, MeterValuesTriggerLoop};
use ocpp_gateway::meter;
use ocpp_gateway::persistence::{JsonPowerStore, LearnedPowerStore};
use ocpp_gateway::shutdown::ShutdownSignal;
use ocpp_gateway::state::{ChargerRegistry, PendingRequests, SitePowerFeed};
use ocpp_gateway::GatewayResult;

const CAP_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Configuration ──────────────────────────────────────────
    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    let (config, config_note) = match AppConfig::load(&config_path) {
        Ok(cfg) => (cfg, format!("loaded from {}", config_path.display())),
        Err(e) => (
            AppConfig::default(),
            format!("built-in defaults ({}: {})", config_path.display(), e),
        ),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Starting OCPP demand-control gateway (configuration: {})", config_note);

    // ── Prometheus recorder ────────────────────────────────────
    let metrics_addr: std::net::SocketAddr = config.metrics.address().parse()?;
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
    {
        Ok(()) => info!(addr = %metrics_addr, "Prometheus metrics exposed"),
        Err(e) => warn!(error = %e, "Prometheus exporter not installed; continuing without metrics"),
    }

    // ── Shared state ───────────────────────────────────────────
    let store: Arc<dyn LearnedPowerStore> =
        Arc::new(JsonPowerStore::load(&config.persistence.learned_powers_file));
    let registry = Arc::new(ChargerRegistry::new(config.buffer.max_frames));
    let site_power = Arc::new(SitePowerFeed::new());
    let pending = Arc::new(PendingRequests::new());
    let downstream = Arc::new(LinkRegistry::new("downstream"));
    let upstream = Arc::new(LinkRegistry::new("upstream"));
    let upstream_tasks = Arc::new(UpstreamTasks::new());

    let shutdown = ShutdownSignal::new();
    shutdown.spawn_signal_listener();

    // ── Listeners (failure to bind either is fatal) ────────────
    let gateway_listener = TcpListener::bind(config.server.address()).await?;
    let meter_listener = TcpListener::bind(config.meter.address()).await?;

    // ── Servers and control loops ──────────────────────────────
    let server = GatewayServer::new(
        config.clone(),
        registry.clone(),
        store.clone(),
        downstream.clone(),
        upstream.clone(),
        upstream_tasks.clone(),
        pending.clone(),
    )
    .with_shutdown(shutdown.clone());
    let mut gateway_task = tokio::spawn(async move { server.run(gateway_listener).await });

    let mut meter_task = tokio::spawn(meter::serve(
        meter_listener,
        site_power.clone(),
        shutdown.clone(),
    ));

    DemandControlLoop::new(
        config.control.clone(),
        registry.clone(),
        site_power.clone(),
        downstream.clone(),
        pending.clone(),
    )
    .start(shutdown.clone());

    MeterValuesTriggerLoop::new(
        config.control.trigger_interval_secs,
        registry.clone(),
        downstream.clone(),
        pending.clone(),
    )
    .start(shutdown.clone());

    info!("Gateway up; press Ctrl+C to shut down");

    // A server ending while no shutdown is in progress is fatal. During
    // shutdown both servers finish on their own; whichever future wakes
    // first, the cap release below must still run.
    tokio::select! {
        result = &mut gateway_task => {
            if !shutdown.is_triggered() {
                return Err(fatal_server_exit("Gateway server", result));
            }
            info!("Gateway server stopped");
        }
        result = &mut meter_task => {
            if !shutdown.is_triggered() {
                return Err(fatal_server_exit("Meter server", result));
            }
            info!("Meter server stopped");
        }
        _ = shutdown.wait() => {}
    }

    info!("Shutting down; releasing charger power limits");
    release_learned_caps(&downstream, &registry, &pending).await;

    info!("Gateway shutdown complete");
    Ok(())
}

fn fatal_server_exit(
    name: &str,
    result: Result<GatewayResult<()>, tokio::task::JoinError>,
) -> Box<dyn std::error::Error> {
    match result {
        Ok(Ok(())) => {
            error!("{} exited unexpectedly", name);
            format!("{name} exited unexpectedly").into()
        }
        Ok(Err(e)) => {
            error!(error = %e, "{} failed", name);
            e.into()
        }
        Err(e) => {
            error!(error = %e, "{} task panicked", name);
            e.into()
        }
    }
}

/// Restore every connected charger to its learned maximum and wait, bounded,
/// for the chargers to acknowledge.
async fn release_learned_caps(
    downstream: &LinkRegistry,
    registry: &ChargerRegistry,
    pending: &PendingRequests,
) {
    let connected = downstream.connected_ids();
    if connected.is_empty() {
        info!("No connected chargers to release");
        return;
    }
    info!(chargers = connected.len(), "Releasing power limits");

    let mut release_ids = Vec::new();
    for charger_id in &connected {
        let Some(max_w) = registry.learned_max(charger_id) else {
            continue;
        };
        match send_charging_profile(downstream, registry, pending, charger_id, max_w) {
            Ok(message_id) => release_ids.push(message_id),
            Err(e) => warn!(charger_id = charger_id.as_str(), error = %e, "Release not sent"),
        }
    }

    let all_acknowledged = async {
        while release_ids.iter().any(|id| pending.contains(id)) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(CAP_RELEASE_TIMEOUT, all_acknowledged)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = CAP_RELEASE_TIMEOUT.as_secs(),
            "Some chargers did not acknowledge the release in time"
        );
    } else {
        info!("All power limits released");
    }
}
