use std::sync::Arc;

use stockres_core::{
    FallbackQueue, HealthCheck, HealthThresholds, SequenceAllocator, TransferMonitorState,
};
use stockres_storage::{MovementRepositoryError, StockMovementRepository};

/// Process-wide mutable state of the resilience layer.
///
/// Created once during bootstrap and handed to every component that needs it,
/// so independent instances (tests) never share counters or queues.
#[derive(Clone, Default)]
pub struct ResilienceState {
    queue: Arc<FallbackQueue>,
    transfer_monitor: Arc<TransferMonitorState>,
    allocator: Arc<SequenceAllocator>,
}

impl ResilienceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) -> Arc<FallbackQueue> {
        Arc::clone(&self.queue)
    }

    pub fn transfer_monitor(&self) -> Arc<TransferMonitorState> {
        Arc::clone(&self.transfer_monitor)
    }

    pub fn allocator(&self) -> Arc<SequenceAllocator> {
        Arc::clone(&self.allocator)
    }

    pub fn health_check(&self, thresholds: HealthThresholds) -> HealthCheck {
        HealthCheck::new(self.queue(), self.transfer_monitor(), thresholds)
    }

    /// Restores per-key sequence counters from persisted high-water marks.
    pub async fn seed_sequences(
        &self,
        movements: &StockMovementRepository,
    ) -> Result<usize, MovementRepositoryError> {
        let marks = movements.high_water_marks().await?;
        for (key, high_water) in &marks {
            self.allocator.seed(key, *high_water);
        }
        Ok(marks.len())
    }
}
