//! Domain layer of the inventory resilience subsystem.
//!
//! Everything here is runtime-agnostic shared state and classification logic;
//! the background loops that drive it live in the application crate.

pub mod fallback;
pub mod health;
pub mod monitor;
pub mod ports;
pub mod sequence;
pub mod types;

pub use fallback::{FallbackQueue, FallbackQueueStats};
pub use health::{HealthCheck, HealthReport, HealthStatus, HealthThresholds};
pub use monitor::{TransferMonitorState, TransferScanSnapshot};
pub use ports::{AuditSink, AuditSinkError, TransferQueryError, TransferRepository};
pub use sequence::SequenceAllocator;
