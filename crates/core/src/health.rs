//! Health classification for the inventory resilience layer.

use std::sync::Arc;

use chrono::SecondsFormat;
use serde::Serialize;

use crate::fallback::FallbackQueue;
use crate::monitor::TransferMonitorState;

/// Rendered in place of the check time before the first transfer scan.
pub const NEVER_CHECKED: &str = "never";

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Degraded still serves traffic.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Fallback queue depths at which the status escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub warning: usize,
    pub critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning: 100,
            critical: 500,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, queue_size: usize) -> HealthStatus {
        if queue_size >= self.critical {
            HealthStatus::Unhealthy
        } else if queue_size >= self.warning {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// The three data fields external consumers depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub fallback_queue_size: usize,
    pub last_overdue_transfer_count: u64,
    pub last_transfer_check: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
    pub data: HealthData,
}

/// Samples the fallback queue and the transfer monitor on demand.
///
/// A pure read of shared state: cheap, safe to call concurrently and infallible.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    queue: Arc<FallbackQueue>,
    monitor: Arc<TransferMonitorState>,
    thresholds: HealthThresholds,
}

impl HealthCheck {
    pub fn new(
        queue: Arc<FallbackQueue>,
        monitor: Arc<TransferMonitorState>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            queue,
            monitor,
            thresholds,
        }
    }

    pub fn check(&self) -> HealthReport {
        let queue_size = self.queue.len();
        let scan = self.monitor.snapshot();
        let status = self.thresholds.classify(queue_size);

        let description = match status {
            HealthStatus::Healthy => "Inventory resilience layer is healthy".to_string(),
            HealthStatus::Degraded => {
                format!("Audit fallback queue is elevated ({queue_size} entries pending)")
            }
            HealthStatus::Unhealthy => {
                format!("Audit fallback queue is critically high ({queue_size} entries pending)")
            }
        };

        HealthReport {
            status,
            description,
            data: HealthData {
                fallback_queue_size: queue_size,
                last_overdue_transfer_count: scan.overdue_count,
                last_transfer_check: scan
                    .last_check
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
                    .unwrap_or_else(|| NEVER_CHECKED.to_string()),
            },
        }
    }
}
