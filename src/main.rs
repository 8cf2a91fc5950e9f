use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use edge_shield::audit::spawn_audit_worker;
use edge_shield::config::load_config;
use edge_shield::monitor::HealthMonitor;
use edge_shield::server::{admin, gateway_router, Shield};
use edge_shield::utils::init_logging;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging()?;
    tracing::info!("Starting edge shield...");

    // Load configuration
    let settings = load_config().context("failed to load configuration")?;
    tracing::info!(
        host = %settings.server.host,
        port = %settings.server.port,
        upstream = %settings.upstream.url,
        pow = settings.gate.pow,
        rate_limit = settings.gate.rate_limit,
        "Configuration loaded"
    );

    if let Some(addr) = settings.metrics.listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let Shield {
        gateway,
        admin: admin_state,
        audit_rx,
        audit_sinks,
        housekeeping,
    } = Shield::build(&settings)
        .await
        .context("failed to initialize collaborators")?;

    spawn_audit_worker(audit_rx, audit_sinks);
    housekeeping.spawn(HOUSEKEEPING_INTERVAL);

    if settings.monitor.enabled {
        let probe = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.upstream.timeout_seconds))
            .build()?;
        HealthMonitor::new(
            gateway.audit.clone(),
            probe,
            settings.upstream.url.clone(),
            Duration::from_secs(settings.monitor.interval_seconds),
        )
        .spawn();
    }

    if settings.admin.enabled {
        let addr = settings.admin_addr()?;
        let app = admin::router(admin_state);
        tokio::spawn(async move {
            tracing::info!(%addr, "Admin API listening");
            if let Err(e) = axum::Server::bind(&addr).serve(app.into_make_service()).await {
                tracing::error!(error = %e, "admin server error");
            }
        });
    }

    let addr = settings.listen_addr()?;
    let app = gateway_router(gateway);
    tracing::info!(%addr, "Edge shield listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    tracing::info!("Edge shield stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
