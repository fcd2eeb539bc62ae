use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{info, warn};

use stockres_core::ports::{TransferQueryError, TransferRepository};
use stockres_core::{TransferMonitorState, TransferScanSnapshot};

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub sla: Duration,
    pub interval: Duration,
    pub query_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sla: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(300),
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// Background worker that counts stock transfers left open past the SLA window.
#[derive(Clone)]
pub struct TransferTimeoutMonitor {
    repository: Arc<dyn TransferRepository>,
    state: Arc<TransferMonitorState>,
    settings: MonitorSettings,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl TransferTimeoutMonitor {
    pub fn new(
        repository: Arc<dyn TransferRepository>,
        state: Arc<TransferMonitorState>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            repository,
            state,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Overrides the clock used for cut-off and check times.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background until `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stage = "transfer",
            interval_secs = self.settings.interval.as_secs_f64(),
            sla_secs = self.settings.sla.as_secs(),
            "transfer timeout monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // A scan interrupted by shutdown publishes nothing.
            let scan = tokio::select! {
                result = self.run_once() => result,
                _ = wait_for_stop(&mut shutdown) => break,
            };
            if let Err(err) = scan {
                counter!("transfer_monitor_failures_total").increment(1);
                let previous = self.state.snapshot();
                warn!(
                    stage = "transfer",
                    error = %err,
                    kept_count = previous.overdue_count,
                    "overdue transfer scan failed; keeping previous result"
                );
            }
        }
        info!(stage = "transfer", "transfer timeout monitor stopped");
    }

    /// Executes one scan and publishes its result.
    ///
    /// On failure the previously published values stay untouched.
    pub async fn run_once(&self) -> Result<TransferScanSnapshot, MonitorError> {
        let cutoff = ChronoDuration::from_std(self.settings.sla)
            .ok()
            .and_then(|sla| (self.clock)().checked_sub_signed(sla))
            .ok_or(MonitorError::SlaOutOfRange(self.settings.sla))?;

        let query_timeout = self.settings.query_timeout;
        let overdue = timeout(query_timeout, self.repository.find_overdue_transfers(cutoff))
            .await
            .map_err(|_| TransferQueryError::Timeout(query_timeout.as_millis() as u64))??;

        let completed_at = (self.clock)();
        let snapshot = self.state.publish(overdue.len() as u64, completed_at);
        gauge!("stock_transfers_overdue").set(snapshot.overdue_count as f64);

        if let Some(oldest) = overdue.iter().min_by_key(|transfer| transfer.opened_at) {
            warn!(
                stage = "transfer",
                overdue = snapshot.overdue_count,
                oldest_transfer = %oldest.transfer_id,
                oldest_opened_at = %oldest.opened_at.to_rfc3339(),
                cutoff = %cutoff.to_rfc3339(),
                "stock transfers open past SLA"
            );
        } else {
            info!(
                stage = "transfer",
                cutoff = %cutoff.to_rfc3339(),
                "no overdue stock transfers"
            );
        }

        Ok(snapshot)
    }
}

async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("transfer query failed: {0}")]
    Query(#[from] TransferQueryError),
    #[error("SLA window {0:?} is out of range")]
    SlaOutOfRange(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{overdue_transfer, ScriptedTransfers};
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tokio::time::timeout as tokio_timeout;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            sla: Duration::from_secs(24 * 3600),
            interval: Duration::from_millis(10),
            query_timeout: Duration::from_millis(100),
        }
    }

    fn fixed_clock(at: DateTime<Utc>) -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
        Arc::new(move || at)
    }

    #[tokio::test]
    async fn publishes_count_and_check_time() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let repo = Arc::new(ScriptedTransfers::returning(vec![
            overdue_transfer("T-1", now - ChronoDuration::hours(30)),
            overdue_transfer("T-2", now - ChronoDuration::hours(26)),
        ]));
        let state = Arc::new(TransferMonitorState::new());
        let monitor = TransferTimeoutMonitor::new(repo.clone(), state.clone(), settings())
            .with_clock(fixed_clock(now));

        let snapshot = monitor.run_once().await.expect("scan succeeds");

        assert_eq!(snapshot.overdue_count, 2);
        assert_eq!(snapshot.last_check, Some(now));
        assert_eq!(state.snapshot(), snapshot);
        assert_eq!(repo.cutoffs(), vec![now - ChronoDuration::hours(24)]);
    }

    #[tokio::test]
    async fn failed_scan_keeps_previous_values() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let repo = Arc::new(ScriptedTransfers::returning(vec![overdue_transfer(
            "T-1",
            now - ChronoDuration::hours(48),
        )]));
        let state = Arc::new(TransferMonitorState::new());
        let monitor = TransferTimeoutMonitor::new(repo.clone(), state.clone(), settings())
            .with_clock(fixed_clock(now));
        monitor.run_once().await.expect("first scan");

        repo.set(Err(TransferQueryError::Unavailable("database locked".to_string())));
        let err = monitor.run_once().await.expect_err("second scan fails");

        assert!(matches!(err, MonitorError::Query(TransferQueryError::Unavailable(_))));
        assert_eq!(state.snapshot().overdue_count, 1);
        assert_eq!(state.snapshot().last_check, Some(now));
    }

    #[tokio::test]
    async fn failure_before_first_scan_leaves_defaults() {
        let repo = Arc::new(ScriptedTransfers::returning(Vec::new()));
        repo.set(Err(TransferQueryError::Unavailable("offline".to_string())));
        let state = Arc::new(TransferMonitorState::new());
        let monitor = TransferTimeoutMonitor::new(repo, state.clone(), settings());

        assert!(monitor.run_once().await.is_err());
        assert_eq!(state.snapshot(), TransferScanSnapshot::default());
    }

    #[tokio::test]
    async fn sla_beyond_calendar_range_fails_without_querying() {
        let repo = Arc::new(ScriptedTransfers::returning(Vec::new()));
        let state = Arc::new(TransferMonitorState::new());
        let huge_sla = Duration::from_secs(3_000_000_000 * 3600);
        let monitor = TransferTimeoutMonitor::new(
            repo.clone(),
            state.clone(),
            MonitorSettings {
                sla: huge_sla,
                ..settings()
            },
        );

        let err = monitor.run_once().await.expect_err("cutoff out of range");

        assert!(matches!(err, MonitorError::SlaOutOfRange(sla) if sla == huge_sla));
        assert!(repo.cutoffs().is_empty());
        assert_eq!(state.snapshot(), TransferScanSnapshot::default());
    }

    #[tokio::test]
    async fn check_time_is_monotonic_and_not_in_future() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        // Clock jumps backwards between the second and third scans.
        let ticks = Arc::new(Mutex::new(vec![
            start,
            start + ChronoDuration::seconds(1),
            start + ChronoDuration::seconds(60),
            start + ChronoDuration::seconds(61),
            start + ChronoDuration::seconds(10),
            start + ChronoDuration::seconds(11),
        ]));
        let clock_ticks = ticks.clone();
        let clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> = Arc::new(move || {
            let mut ticks = clock_ticks.lock().expect("ticks lock");
            if ticks.len() > 1 {
                ticks.remove(0)
            } else {
                ticks[0]
            }
        });

        let state = Arc::new(TransferMonitorState::new());
        let monitor = TransferTimeoutMonitor::new(
            Arc::new(ScriptedTransfers::returning(Vec::new())),
            state.clone(),
            settings(),
        )
        .with_clock(clock);

        let mut previous = None;
        for _ in 0..3 {
            let snapshot = monitor.run_once().await.expect("scan");
            let checked = snapshot.last_check.expect("check time set");
            assert!(checked <= Utc::now());
            if let Some(previous) = previous {
                assert!(checked >= previous);
            }
            previous = Some(checked);
        }
        assert_eq!(previous, Some(start + ChronoDuration::seconds(61)));
    }

    #[tokio::test]
    async fn spawned_monitor_publishes_and_stops_on_shutdown() {
        let repo = Arc::new(ScriptedTransfers::returning(vec![overdue_transfer(
            "T-9",
            Utc::now() - ChronoDuration::days(3),
        )]));
        let state = Arc::new(TransferMonitorState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = TransferTimeoutMonitor::new(repo, state.clone(), settings()).spawn(shutdown_rx);

        tokio_timeout(Duration::from_secs(2), async {
            while state.snapshot().last_check.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first scan published");
        assert_eq!(state.snapshot().overdue_count, 1);

        shutdown_tx.send(true).expect("send shutdown");
        tokio_timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor stopped")
            .expect("monitor did not panic");
    }
}
