use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{
    BuildError as PrometheusBuildError, PrometheusBuilder, PrometheusHandle,
};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use stockres_core::{HealthReport, HealthStatus};
use stockres_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] PrometheusBuildError),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: OnceLock<Mutex<()>> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.environment {
        Environment::Development | Environment::Test => registry
            .with(
                tracing_fmt::layer()
                    .with_target(false)
                    .with_timer(UtcTime::rfc_3339())
                    .event_format(tracing_fmt::format().pretty()),
            )
            .try_init()?,
        Environment::Production => registry
            .with(
                tracing_fmt::layer()
                    .with_target(false)
                    .with_timer(UtcTime::rfc_3339())
                    .json(),
            )
            .try_init()?,
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = METRICS_INSTALL_GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle.clone()).ok();
    describe_metrics();
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    describe_counter!(
        "audit_writes_total",
        "Count of audit writes by business operations, labelled by result (direct, fallback)"
    );
    describe_counter!(
        "audit_fallback_enqueued_total",
        "Count of audit records parked in the fallback queue after a failed durable write"
    );
    describe_counter!(
        "audit_fallback_persisted_total",
        "Count of deferred audit records eventually written by the fallback processor"
    );
    describe_counter!(
        "audit_fallback_requeued_total",
        "Count of deferred audit writes that failed again and were requeued"
    );
    describe_counter!(
        "audit_fallback_discarded_total",
        "Count of audit records dropped after exhausting their retry ceiling"
    );
    describe_gauge!(
        "audit_fallback_queue_depth",
        "Entries waiting in the audit fallback queue at the end of the last drain cycle"
    );
    describe_histogram!(
        "audit_fallback_cycle_seconds",
        "Duration of audit fallback drain cycles in seconds"
    );
    describe_gauge!(
        "stock_transfers_overdue",
        "Open stock transfers past the SLA window as of the last completed scan"
    );
    describe_counter!(
        "transfer_monitor_failures_total",
        "Count of overdue transfer scans that failed"
    );
    describe_counter!("stock_movements_total", "Count of stock movements recorded");
    describe_counter!(
        "health_checks_total",
        "Count of health checks served, labelled by status"
    );
}

/// Renders the recorder output plus build info and a live sample of the health signal.
pub fn render_metrics(handle: &PrometheusHandle, health: &HealthReport) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    let status_level = match health.status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    };

    // Writing into a String cannot fail.
    let _ = write!(
        body,
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {}\n\
         # TYPE resilience_health_status gauge\n\
         resilience_health_status {}\n\
         # TYPE audit_fallback_queue_size gauge\n\
         audit_fallback_queue_size {}\n",
        BUILD_VERSION,
        build_git_sha(),
        uptime,
        status_level,
        health.data.fallback_queue_size,
    );

    body
}
