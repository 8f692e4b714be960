//! Keeps an owned lease alive.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sleep_or_cancel;
use crate::error::Result;
use crate::lease::{Lease, LeaseManager};
use crate::observability::ChangeFeedMetrics;

/// Periodically renews one lease until cancelled or the lease is lost
pub struct LeaseRenewer {
    lease_manager: Arc<LeaseManager>,
    lease: Lease,
    renew_interval: Duration,
}

impl LeaseRenewer {
    pub fn new(lease_manager: Arc<LeaseManager>, lease: Lease, renew_interval: Duration) -> Self {
        Self {
            lease_manager,
            lease,
            renew_interval,
        }
    }

    /// Returns `Ok(())` when cancelled and `LeaseLost` when ownership moved
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!(lease_token = %self.lease.lease_token, "Lease renewer started");
        while sleep_or_cancel(&token, self.renew_interval).await {
            match self.lease_manager.renew(&self.lease).await {
                Ok(renewed) => {
                    debug!(lease_token = %renewed.lease_token, "Lease renewed");
                    self.lease = renewed;
                }
                Err(e) if e.is_lease_lost() => {
                    info!(lease_token = %self.lease.lease_token, "Lease lost during renewal");
                    ChangeFeedMetrics::increment_leases_lost();
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        lease_token = %self.lease.lease_token,
                        error = %e,
                        "Lease renewal failed, will retry"
                    );
                }
            }
        }
        info!(lease_token = %self.lease.lease_token, "Lease renewer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedRange, PartitionKeyRange, Range};
    use crate::store::memory::InMemoryLeaseContainer;

    async fn owned_lease(manager: &LeaseManager) -> Lease {
        let lease = manager
            .create_lease_if_not_exist(
                FeedRange::partition_key_range(&PartitionKeyRange::new("0", Range::full())),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        manager.acquire(&lease).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_until_cancelled() {
        let container = Arc::new(InMemoryLeaseContainer::new("leases"));
        let manager = Arc::new(LeaseManager::new(container, "cf", "host-a"));
        let lease = owned_lease(&manager).await;
        let before = lease.timestamp;

        let token = CancellationToken::new();
        let task = tokio::spawn(
            LeaseRenewer::new(manager.clone(), lease.clone(), Duration::from_secs(1))
                .run(token.clone()),
        );
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        token.cancel();
        task.await.unwrap().unwrap();

        let stored = manager.read_lease(&lease).await.unwrap();
        assert!(stored.is_owned_by("host-a"));
        assert!(stored.timestamp >= before);
        assert_ne!(stored.concurrency_token, lease.concurrency_token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_lease_taken() {
        let container = Arc::new(InMemoryLeaseContainer::new("leases"));
        let a = Arc::new(LeaseManager::new(container.clone(), "cf", "host-a"));
        let b = LeaseManager::new(container, "cf", "host-b");
        let lease = owned_lease(&a).await;

        let token = CancellationToken::new();
        let task = tokio::spawn(
            LeaseRenewer::new(a.clone(), lease.clone(), Duration::from_secs(1)).run(token.clone()),
        );
        b.acquire(&lease).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_lease_lost());
        assert!(!token.is_cancelled());
    }
}
