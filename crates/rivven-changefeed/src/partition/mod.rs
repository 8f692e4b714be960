//! Partition runtime: everything that runs per owned lease and the
//! machinery deciding which leases this host owns.
//!
//! ```text
//! PartitionManager
//!   ├── Bootstrapper ──► PartitionSynchronizer (create missing leases)
//!   ├── PartitionLoadBalancer ──► LoadBalancingStrategy
//!   │          └── acquire ──► PartitionController
//!   └── PartitionController
//!          └── PartitionSupervisor (one per lease)
//!                 ├── PartitionProcessor
//!                 └── LeaseRenewer
//! ```

pub mod bootstrapper;
pub mod controller;
pub mod health;
pub mod load_balancer;
pub mod manager;
pub mod processor;
pub mod renewer;
pub mod strategy;
pub mod supervisor;
pub mod synchronizer;

pub use bootstrapper::Bootstrapper;
pub use controller::{DefaultPartitionController, PartitionController};
pub use health::{
    HealthMonitor, HealthMonitoringController, HealthMonitoringRecord, HealthSeverity,
    MonitoredOperation, TracingHealthMonitor,
};
pub use load_balancer::PartitionLoadBalancer;
pub use manager::PartitionManager;
pub use processor::{PartitionProcessor, ProcessorSettings};
pub use renewer::LeaseRenewer;
pub use strategy::{EqualPartitionsBalancingStrategy, LoadBalancingStrategy};
pub use supervisor::{PartitionSupervisor, PartitionSupervisorFactory};
pub use synchronizer::{FeedRangeGoneHandler, PartitionSynchronizer};

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` fires first.
///
/// Returns `true` if the full duration elapsed.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
