mod audit;
mod fallback;
mod movement;
mod problem;
mod router;
mod state;
mod telemetry;
mod transfer_monitor;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use tokio::sync::watch;
use tracing::{error, info, warn};

use stockres_core::ports::{AuditSink, TransferRepository};
use stockres_core::HealthThresholds;
use stockres_storage::Database;
use stockres_util::{load_env_file, AppConfig};

use crate::audit::AuditRecorder;
use crate::fallback::{AuditFallbackProcessor, FallbackSettings};
use crate::movement::StockMovementService;
use crate::state::ResilienceState;
use crate::transfer_monitor::{MonitorSettings, TransferTimeoutMonitor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let resilience = ResilienceState::new();
    let seeded = resilience
        .seed_sequences(&database.stock_movements())
        .await?;
    info!(stage = "app", keys = seeded, "sequence counters restored");

    let settings = &config.resilience;
    let sink: Arc<dyn AuditSink> = Arc::new(database.audit_log());
    let recorder = AuditRecorder::new(
        Arc::clone(&sink),
        resilience.queue(),
        settings.audit_write_timeout,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = AuditFallbackProcessor::new(
        resilience.queue(),
        sink,
        FallbackSettings {
            max_retries: settings.fallback_max_retries,
            interval: settings.fallback_interval,
            write_timeout: settings.audit_write_timeout,
        },
    )
    .spawn(shutdown_rx.clone());

    let transfers: Arc<dyn TransferRepository> = Arc::new(database.stock_transfers());
    let monitor = TransferTimeoutMonitor::new(
        transfers,
        resilience.transfer_monitor(),
        MonitorSettings {
            sla: settings.transfer_sla,
            interval: settings.transfer_monitor_interval,
            query_timeout: settings.transfer_query_timeout,
        },
    )
    .spawn(shutdown_rx);

    let health = resilience.health_check(HealthThresholds {
        warning: settings.fallback_warning_threshold,
        critical: settings.fallback_critical_threshold,
    });
    let movements = StockMovementService::new(database, resilience.allocator(), recorder);
    let state = router::AppState::new(metrics, health, movements);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await;

    info!(stage = "app", "stopping background workers");
    // Receivers may already be gone if a worker exited early.
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("audit_fallback", processor), ("transfer_monitor", monitor)] {
        if let Err(err) = handle.await {
            error!(stage = "app", worker = name, error = %err, "background worker terminated abnormally");
        }
    }

    let pending = resilience.queue().len();
    if pending > 0 {
        warn!(
            stage = "app",
            pending, "audit fallback queue not empty at shutdown; entries are lost"
        );
    }

    served.map_err(|err| err.into())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(stage = "app", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(stage = "app", error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(stage = "app", "received ctrl-c"),
        _ = terminate => info!(stage = "app", "received SIGTERM"),
    }
}
