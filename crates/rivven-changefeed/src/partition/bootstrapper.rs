//! One-time lease inventory creation, coordinated across hosts.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::PartitionSynchronizer;
use crate::error::{ChangeFeedError, Result};
use crate::lease::LeaseStore;
use crate::store::{SharedLeaseContainer, LEASE_PARTITION_KEY_PATH};

/// Makes sure every partition has a lease before balancing starts.
///
/// Exactly one host creates the missing leases under the initialization
/// lock; the others wait for the `.info` marker.
pub struct Bootstrapper {
    lease_container: SharedLeaseContainer,
    lease_store: Arc<LeaseStore>,
    synchronizer: Arc<PartitionSynchronizer>,
    lock_time: Duration,
    retry_delay: Duration,
}

impl Bootstrapper {
    pub fn new(
        lease_container: SharedLeaseContainer,
        lease_store: Arc<LeaseStore>,
        synchronizer: Arc<PartitionSynchronizer>,
        lock_time: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            lease_container,
            lease_store,
            synchronizer,
            lock_time,
            retry_delay,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        let path = self.lease_container.partition_key_path();
        if path != LEASE_PARTITION_KEY_PATH {
            return Err(ChangeFeedError::config(format!(
                "lease container '{}' must be partitioned by '{}', found '{}'",
                self.lease_container.name(),
                LEASE_PARTITION_KEY_PATH,
                path
            )));
        }

        loop {
            if self.lease_store.is_initialized().await? {
                debug!("Lease store already initialized");
                return Ok(());
            }

            if !self.lease_store.acquire_initialization_lock(self.lock_time).await? {
                info!(
                    retry_in = ?self.retry_delay,
                    "Another host is initializing the lease store"
                );
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }

            info!("Initializing lease store");
            let result = self.populate().await;
            if let Err(e) = self.lease_store.release_initialization_lock().await {
                warn!(error = %e, "Failed to release initialization lock");
            }
            return result;
        }
    }

    async fn populate(&self) -> Result<()> {
        let created = self.synchronizer.create_missing_leases().await?;
        self.lease_store.mark_initialized().await?;
        info!(created, "Lease store initialized");
        Ok(())
    }
}
