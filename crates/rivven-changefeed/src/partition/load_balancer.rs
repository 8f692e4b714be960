//! Periodic lease acquisition.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{sleep_or_cancel, LoadBalancingStrategy, PartitionController};
use crate::error::Result;
use crate::lease::LeaseManager;

#[derive(Clone)]
struct BalancingCycle {
    controller: Arc<dyn PartitionController>,
    lease_manager: Arc<LeaseManager>,
    strategy: Arc<dyn LoadBalancingStrategy>,
}

impl BalancingCycle {
    async fn run(&self) -> Result<usize> {
        let leases = self.lease_manager.get_all_leases().await?;
        let candidates = self.strategy.select_leases_to_take(&leases);
        if candidates.is_empty() {
            return Ok(0);
        }
        debug!(
            host = self.lease_manager.host_name(),
            candidates = candidates.len(),
            "Trying to take leases"
        );

        let count = candidates.len();
        let attempts = candidates.into_iter().map(|lease| {
            let controller = self.controller.clone();
            async move {
                let lease_token = lease.lease_token.clone();
                (lease_token, controller.add_or_update_lease(lease).await)
            }
        });
        for (lease_token, result) in join_all(attempts).await {
            if let Err(e) = result {
                debug!(lease_token = %lease_token, error = %e, "Lease not taken this cycle");
            }
        }
        Ok(count)
    }
}

/// Runs the balancing strategy every acquire interval.
///
/// Candidates are handed to the controller concurrently; one failing
/// acquisition does not hold up the others.
pub struct PartitionLoadBalancer {
    cycle: BalancingCycle,
    acquire_interval: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionLoadBalancer {
    pub fn new(
        controller: Arc<dyn PartitionController>,
        lease_manager: Arc<LeaseManager>,
        strategy: Arc<dyn LoadBalancingStrategy>,
        acquire_interval: Duration,
    ) -> Self {
        Self {
            cycle: BalancingCycle {
                controller,
                lease_manager,
                strategy,
            },
            acquire_interval,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// One balancing pass. Returns the number of candidates tried.
    pub async fn run_cycle(&self) -> Result<usize> {
        self.cycle.run().await
    }

    /// Start the background loop; the first cycle runs immediately
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let cycle = self.cycle.clone();
        let interval = self.acquire_interval;
        let token = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            info!(host = cycle.lease_manager.host_name(), "Load balancer started");
            loop {
                if let Err(e) = cycle.run().await {
                    warn!(error = %e, "Load balancing cycle failed");
                }
                if !sleep_or_cancel(&token, interval).await {
                    break;
                }
            }
            info!(host = cycle.lease_manager.host_name(), "Load balancer stopped");
        }));
    }

    /// Stop the loop and wait for the current cycle to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Load balancer task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChangeFeedError;
    use crate::feed::{FeedRange, PartitionKeyRange, Range};
    use crate::lease::Lease;
    use crate::partition::EqualPartitionsBalancingStrategy;
    use crate::store::memory::InMemoryLeaseContainer;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PartitionController for Recording {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn add_or_update_lease(&self, lease: Lease) -> Result<()> {
            self.seen.lock().push(lease.lease_token.clone());
            if lease.lease_token == "0" {
                return Err(ChangeFeedError::lease_lost("0", Some("other".into())));
            }
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn setup(count: usize) -> (Arc<Recording>, PartitionLoadBalancer) {
        let container = Arc::new(InMemoryLeaseContainer::new("leases"));
        let manager = Arc::new(LeaseManager::new(container, "cf", "me"));
        for i in 0..count {
            manager
                .create_lease_if_not_exist(
                    FeedRange::partition_key_range(&PartitionKeyRange::new(
                        i.to_string(),
                        Range::full(),
                    )),
                    None,
                )
                .await
                .unwrap();
        }
        let controller = Arc::new(Recording::default());
        let strategy = Arc::new(EqualPartitionsBalancingStrategy::new(
            "me",
            0,
            0,
            Duration::from_secs(60),
        ));
        let balancer = PartitionLoadBalancer::new(
            controller.clone(),
            manager,
            strategy,
            Duration::from_secs(10),
        );
        (controller, balancer)
    }

    #[tokio::test]
    async fn test_cycle_offers_every_candidate_despite_failures() {
        let (controller, balancer) = setup(3).await;
        assert_eq!(balancer.run_cycle().await.unwrap(), 3);
        let mut seen = controller.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_every_interval_until_stopped() {
        let (controller, balancer) = setup(1).await;
        balancer.start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        balancer.stop().await;

        // Cycles at 0s, 10s and 20s.
        assert_eq!(controller.seen.lock().len(), 3);
    }
}
