use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use tokio::{
    sync::watch,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use stockres_core::ports::{AuditSink, AuditSinkError};
use stockres_core::types::FallbackEntry;
use stockres_core::FallbackQueue;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct FallbackSettings {
    pub max_retries: u32,
    pub interval: Duration,
    pub write_timeout: Duration,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval: DEFAULT_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Tally of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Queue depth snapshotted when the cycle started.
    pub budget: usize,
    pub persisted: usize,
    pub requeued: usize,
    pub discarded: usize,
    /// Cycle stopped early because shutdown was requested.
    pub aborted: bool,
}

impl CycleReport {
    pub fn processed(&self) -> usize {
        self.persisted + self.requeued + self.discarded
    }
}

/// Background worker that drains the fallback queue into the durable audit sink.
///
/// Entries are retried until their retry count reaches the ceiling, after which
/// they are discarded with a full log record of what was lost.
#[derive(Clone)]
pub struct AuditFallbackProcessor {
    queue: Arc<FallbackQueue>,
    sink: Arc<dyn AuditSink>,
    settings: FallbackSettings,
}

impl AuditFallbackProcessor {
    pub fn new(queue: Arc<FallbackQueue>, sink: Arc<dyn AuditSink>, settings: FallbackSettings) -> Self {
        Self {
            queue,
            sink,
            settings,
        }
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
            stage = "fallback",
            interval_secs = self.settings.interval.as_secs_f64(),
            max_retries = self.settings.max_retries,
            "audit fallback processor started"
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
            if *shutdown.borrow() {
                break;
            }

            let report = self.drain(|| *shutdown.borrow()).await;
            if report.budget > 0 {
                info!(
                    stage = "fallback",
                    budget = report.budget,
                    persisted = report.persisted,
                    requeued = report.requeued,
                    discarded = report.discarded,
                    aborted = report.aborted,
                    remaining = self.queue.len(),
                    "audit fallback cycle completed"
                );
            }
        }
        info!(
            stage = "fallback",
            pending = self.queue.len(),
            "audit fallback processor stopped"
        );
    }

    /// Executes one drain cycle over the entries present when it starts.
    pub async fn run_once(&self) -> CycleReport {
        self.drain(|| false).await
    }

    async fn drain(&self, cancelled: impl Fn() -> bool) -> CycleReport {
        let started = Instant::now();
        // Entries requeued or enqueued during this cycle wait for the next one.
        let budget = self.queue.len();
        let mut report = CycleReport {
            budget,
            ..CycleReport::default()
        };

        for _ in 0..budget {
            if cancelled() {
                report.aborted = true;
                break;
            }
            let Some(entry) = self.queue.try_dequeue() else {
                break;
            };

            if entry.is_exhausted(self.settings.max_retries) {
                self.discard(&entry);
                report.discarded += 1;
                continue;
            }

            match self.attempt(&entry).await {
                Ok(()) => {
                    counter!("audit_fallback_persisted_total").increment(1);
                    debug!(
                        stage = "fallback",
                        entry_id = %entry.id,
                        record_id = %entry.record.id,
                        retry_count = entry.retry_count,
                        "deferred audit record persisted"
                    );
                    report.persisted += 1;
                }
                Err(err) => {
                    let mut entry = entry;
                    entry.record_failure(err.to_string());
                    if entry.is_exhausted(self.settings.max_retries) {
                        self.discard(&entry);
                        report.discarded += 1;
                    } else {
                        self.requeue(entry, &err);
                        report.requeued += 1;
                    }
                }
            }
        }

        gauge!("audit_fallback_queue_depth").set(self.queue.len() as f64);
        histogram!("audit_fallback_cycle_seconds").record(started.elapsed().as_secs_f64());
        report
    }

    async fn attempt(&self, entry: &FallbackEntry) -> Result<(), AuditSinkError> {
        let write_timeout = self.settings.write_timeout;
        match timeout(write_timeout, self.sink.write(&entry.record)).await {
            Ok(result) => result,
            Err(_) => Err(AuditSinkError::Timeout(write_timeout.as_millis() as u64)),
        }
    }

    fn requeue(&self, entry: FallbackEntry, err: &AuditSinkError) {
        warn!(
            stage = "fallback",
            entry_id = %entry.id,
            record_id = %entry.record.id,
            retry_count = entry.retry_count,
            max_retries = self.settings.max_retries,
            error = %err,
            "deferred audit write failed; requeued"
        );
        counter!("audit_fallback_requeued_total").increment(1);
        self.queue.enqueue(entry);
    }

    fn discard(&self, entry: &FallbackEntry) {
        let record = &entry.record;
        counter!("audit_fallback_discarded_total").increment(1);
        error!(
            stage = "fallback",
            entry_id = %entry.id,
            record_id = %record.id,
            timestamp = %record.timestamp.to_rfc3339(),
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            entity_name = record.entity_name.as_deref().unwrap_or(""),
            action = record.action.as_str(),
            tenant_id = record.tenant_id.as_deref().unwrap_or(""),
            old_value = record.old_value.as_deref().unwrap_or(""),
            new_value = record.new_value.as_deref().unwrap_or(""),
            additional_data = record.additional_data.as_deref().unwrap_or(""),
            retry_count = entry.retry_count,
            failure_reason = entry.failure_reason.as_deref().unwrap_or(""),
            "audit record discarded after exhausting retries"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fallback_entry, HangingSink, ToggleSink};
    use tokio::time::timeout as tokio_timeout;

    fn processor(queue: &Arc<FallbackQueue>, sink: Arc<dyn AuditSink>) -> AuditFallbackProcessor {
        AuditFallbackProcessor::new(
            Arc::clone(queue),
            sink,
            FallbackSettings {
                interval: Duration::from_millis(10),
                write_timeout: Duration::from_millis(50),
                ..FallbackSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn persists_entries_when_sink_recovers() {
        let queue = Arc::new(FallbackQueue::new());
        for n in 0..10 {
            queue.enqueue(fallback_entry(&format!("SM-{n}"), 1));
        }
        let sink = Arc::new(ToggleSink::online());

        let report = processor(&queue, sink.clone()).run_once().await;

        assert_eq!(report.persisted, 10);
        assert_eq!(report.processed(), 10);
        assert!(queue.is_empty());
        assert_eq!(sink.written().len(), 10);
    }

    #[tokio::test]
    async fn failed_attempt_increments_retry_and_overwrites_reason() {
        let queue = Arc::new(FallbackQueue::new());
        queue.enqueue(fallback_entry("SM-1", 2));
        let sink = Arc::new(ToggleSink::offline());

        let report = processor(&queue, sink).run_once().await;

        assert_eq!(report.requeued, 1);
        let entry = queue.try_dequeue().expect("entry requeued");
        assert_eq!(entry.retry_count, 3);
        assert_eq!(
            entry.failure_reason.as_deref(),
            Some("audit store unavailable: connection refused")
        );
    }

    #[tokio::test]
    async fn cycle_only_processes_snapshotted_depth() {
        let queue = Arc::new(FallbackQueue::new());
        for n in 0..25 {
            queue.enqueue(fallback_entry(&format!("SM-{n}"), 0));
        }
        let sink = Arc::new(ToggleSink::offline());

        let report = processor(&queue, sink.clone()).run_once().await;

        assert_eq!(report.budget, 25);
        assert_eq!(report.requeued, 25);
        assert_eq!(sink.attempts(), 25);
        // Requeued entries are not revisited within the same cycle.
        while let Some(entry) = queue.try_dequeue() {
            assert_eq!(entry.retry_count, 1);
        }
    }

    #[tokio::test]
    async fn mixed_population_is_partitioned_by_ceiling() {
        let queue = Arc::new(FallbackQueue::new());
        let mut below = 0;
        let mut at_or_above = 0;
        let mut attempted = 0;
        for n in 0..40u32 {
            let retry_count = n % 8;
            // One more failure decides which side of the ceiling an entry ends on.
            if retry_count + 1 < DEFAULT_MAX_RETRIES {
                below += 1;
            } else {
                at_or_above += 1;
            }
            if retry_count < DEFAULT_MAX_RETRIES {
                attempted += 1;
            }
            queue.enqueue(fallback_entry(&format!("SM-{n}"), retry_count));
        }
        let sink = Arc::new(ToggleSink::offline());

        let report = processor(&queue, sink.clone()).run_once().await;

        assert_eq!(report.requeued, below);
        assert_eq!(report.discarded, at_or_above);
        assert_eq!(report.requeued + report.discarded, 40);
        assert_eq!(queue.len(), below);
        // Entries already at the ceiling are dropped without another write attempt.
        assert_eq!(sink.attempts(), attempted);
        while let Some(entry) = queue.try_dequeue() {
            assert!(entry.retry_count < DEFAULT_MAX_RETRIES);
        }
    }

    #[tokio::test]
    async fn permanently_failing_sink_eventually_discards_everything() {
        let queue = Arc::new(FallbackQueue::new());
        for n in 0..1000 {
            queue.enqueue(fallback_entry(&format!("SM-{n}"), 0));
        }
        let worker = processor(&queue, Arc::new(ToggleSink::offline()));

        let mut discarded = 0;
        let mut cycles = 0;
        while !queue.is_empty() {
            let report = worker.run_once().await;
            discarded += report.discarded;
            cycles += 1;
            assert!(cycles <= 10, "queue failed to drain");
        }

        assert_eq!(discarded, 1000);
        assert_eq!(cycles, DEFAULT_MAX_RETRIES as usize);
        let stats = queue.stats();
        assert_eq!(stats.enqueued_total, stats.dequeued_total);
    }

    #[tokio::test]
    async fn failure_reaching_ceiling_discards_instead_of_requeueing() {
        let queue = Arc::new(FallbackQueue::new());
        queue.enqueue(fallback_entry("SM-1", DEFAULT_MAX_RETRIES - 1));
        let sink = Arc::new(ToggleSink::offline());

        let report = processor(&queue, sink.clone()).run_once().await;

        assert_eq!(report.discarded, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(sink.attempts(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn hanging_sink_times_out_and_requeues() {
        let queue = Arc::new(FallbackQueue::new());
        queue.enqueue(fallback_entry("SM-1", 0));

        let report = processor(&queue, Arc::new(HangingSink)).run_once().await;

        assert_eq!(report.requeued, 1);
        let entry = queue.try_dequeue().expect("requeued");
        assert!(entry
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("timed out")));
    }

    #[tokio::test]
    async fn cancelled_cycle_keeps_untouched_entries_pending() {
        let queue = Arc::new(FallbackQueue::new());
        for n in 0..10 {
            queue.enqueue(fallback_entry(&format!("SM-{n}"), 0));
        }
        let sink = Arc::new(ToggleSink::online());
        let worker = processor(&queue, sink.clone());

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let report = worker
            .drain(|| calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 4)
            .await;

        assert!(report.aborted);
        assert_eq!(report.persisted, 4);
        assert_eq!(sink.written().len() + queue.len(), 10);
    }

    #[tokio::test]
    async fn spawned_worker_drains_and_stops_on_shutdown() {
        let queue = Arc::new(FallbackQueue::new());
        for n in 0..5 {
            queue.enqueue(fallback_entry(&format!("SM-{n}"), 0));
        }
        let sink = Arc::new(ToggleSink::online());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = processor(&queue, sink.clone()).spawn(shutdown_rx);

        tokio_timeout(Duration::from_secs(2), async {
            while !queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue drained");

        shutdown_tx.send(true).expect("send shutdown");
        tokio_timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stopped")
            .expect("worker did not panic");
        assert_eq!(sink.written().len(), 5);
    }
}
