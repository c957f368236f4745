use anyhow::Context;
use node_scout::host::ScoutHostState;
use node_scout::infrastructure::{audit, config::Settings, server, telemetry::TelemetryBuilder};
use node_scout::ws::BroadcastMessage;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration first, telemetry reads its section
    let config = Settings::new().context("failed to load configuration")?;

    // 2. Telemetry (logging, tracing, metrics)
    let mut telemetry_builder = TelemetryBuilder::new("node-scout", env!("CARGO_PKG_VERSION"))
        .with_log_level(config.telemetry.log_level.clone())
        .with_json(config.telemetry.json_logs)
        .with_sampling_ratio(config.telemetry.sampling_ratio);

    if let Some(ref dir) = config.telemetry.log_dir {
        telemetry_builder = telemetry_builder.with_log_dir(dir);
    }
    if let Some(ref endpoint) = config.telemetry.otlp_endpoint {
        telemetry_builder = telemetry_builder.with_tracing(endpoint);
    }

    let telemetry = telemetry_builder
        .with_metrics()
        .init()
        .context("failed to initialize telemetry")?;

    info!("Node scout starting...");
    audit::log_audit(audit::AuditEvent::SystemStartup {
        component: "Scout".into(),
    });

    // 3. Host state: rpc client, geo client, preferences, orchestrator
    let state = Arc::new(
        ScoutHostState::from_settings(&config, telemetry.metrics_handle())
            .await
            .context("failed to initialize host state")?,
    );
    let shutdown = Arc::new(Notify::new());

    // 4. Refresh scheduler and control plane
    let scheduler = tokio::spawn(Arc::clone(&state.orchestrator).run(Arc::clone(&shutdown)));

    let server_state = Arc::clone(&state);
    let server_shutdown = Arc::clone(&shutdown);
    let server_settings = config.server.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = server::run_server(&server_settings, server_state, server_shutdown).await {
            error!(error = ?e, "Control plane failed");
        }
    });

    info!("Node scout initialized. Waiting for shutdown signal...");

    // 5. Shutdown
    shutdown_signal().await;

    info!("Shutdown signal received, cleaning up...");
    state.broadcaster().broadcast(BroadcastMessage::Shutdown);
    shutdown.notify_waiters();

    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task panicked");
    }
    if let Err(e) = server.await {
        error!(error = %e, "Server task panicked");
    }

    audit::log_audit(audit::AuditEvent::SystemShutdown {
        reason: "Signal received".into(),
    });
    info!("Node scout shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
