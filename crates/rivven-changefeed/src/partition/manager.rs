//! Start/stop sequencing of the partition runtime.

use std::sync::Arc;
use tracing::info;

use super::{Bootstrapper, PartitionController, PartitionLoadBalancer};
use crate::error::Result;

/// Bootstraps the lease inventory, resumes owned leases, then balances
pub struct PartitionManager {
    bootstrapper: Bootstrapper,
    controller: Arc<dyn PartitionController>,
    load_balancer: PartitionLoadBalancer,
}

impl PartitionManager {
    pub fn new(
        bootstrapper: Bootstrapper,
        controller: Arc<dyn PartitionController>,
        load_balancer: PartitionLoadBalancer,
    ) -> Self {
        Self {
            bootstrapper,
            controller,
            load_balancer,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.bootstrapper.initialize().await?;
        self.controller.initialize().await?;
        self.load_balancer.start();
        info!("Partition manager started");
        Ok(())
    }

    /// Stop balancing first so no new leases are taken during shutdown
    pub async fn stop(&self) -> Result<()> {
        self.load_balancer.stop().await;
        self.controller.shutdown().await?;
        info!("Partition manager stopped");
        Ok(())
    }
}
