//! Keeps the lease inventory in line with the container's partitions.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ChangeFeedError, Result};
use crate::feed::{FeedRange, PartitionKeyRange};
use crate::lease::{Lease, LeaseManager};
use crate::observability::ChangeFeedMetrics;
use crate::store::SharedMonitoredContainer;

/// What to do with a lease whose feed range went away
#[derive(Debug, Clone)]
pub enum FeedRangeGoneHandler {
    /// The range was split; one lease per child replaces the parent
    Split {
        lease: Lease,
        children: Vec<PartitionKeyRange>,
    },
    /// The range was merged into `successor`; the lease keeps going
    Merge {
        lease: Lease,
        successor: PartitionKeyRange,
    },
}

impl FeedRangeGoneHandler {
    pub fn lease(&self) -> &Lease {
        match self {
            FeedRangeGoneHandler::Split { lease, .. }
            | FeedRangeGoneHandler::Merge { lease, .. } => lease,
        }
    }

    /// Whether the gone lease must be deleted once its successors run
    pub fn should_delete_current_lease(&self) -> bool {
        matches!(self, FeedRangeGoneHandler::Split { .. })
    }

    /// Produce the leases that continue the gone range.
    ///
    /// Split creates child leases carrying the parent's continuation. Merge
    /// creates nothing and hands back the lease itself, re-bound to an
    /// effective key range if it was a legacy lease.
    pub async fn handle(&self, lease_manager: &LeaseManager) -> Result<Vec<Lease>> {
        match self {
            FeedRangeGoneHandler::Split { lease, children } => {
                let mut created = Vec::with_capacity(children.len());
                for child in children {
                    let feed_range = match &lease.feed_range {
                        FeedRange::PartitionKeyRange { .. } => {
                            FeedRange::partition_key_range(child)
                        }
                        FeedRange::Epk { range } => match range.intersect(&child.range) {
                            Some(clipped) => FeedRange::epk(clipped),
                            None => continue,
                        },
                    };
                    if let Some(new_lease) = lease_manager
                        .create_lease_if_not_exist(feed_range, lease.continuation_token.clone())
                        .await?
                    {
                        created.push(new_lease);
                    }
                }
                info!(
                    lease_token = %lease.lease_token,
                    children = created.len(),
                    "Split handled"
                );
                Ok(created)
            }
            FeedRangeGoneHandler::Merge { lease, successor } => {
                let lease = if lease.feed_range.is_partition_key_range() {
                    lease_manager
                        .update_feed_range(lease, FeedRange::epk(lease.range().clone()))
                        .await?
                } else {
                    lease.clone()
                };
                info!(
                    lease_token = %lease.lease_token,
                    successor = %successor.id,
                    "Merge handled"
                );
                Ok(vec![lease])
            }
        }
    }
}

/// Creates leases for uncovered partitions and resolves gone ranges
pub struct PartitionSynchronizer {
    container: SharedMonitoredContainer,
    lease_manager: Arc<LeaseManager>,
}

impl PartitionSynchronizer {
    pub fn new(container: SharedMonitoredContainer, lease_manager: Arc<LeaseManager>) -> Self {
        Self {
            container,
            lease_manager,
        }
    }

    /// Create a lease for every partition no lease covers yet.
    ///
    /// Returns how many leases this host created.
    pub async fn create_missing_leases(&self) -> Result<usize> {
        let ranges = self.container.read_partition_key_ranges().await?;
        let leases = self.lease_manager.get_all_leases().await?;

        let mut created = 0;
        for pk_range in ranges {
            let covered = leases.iter().any(|lease| match &lease.feed_range {
                FeedRange::PartitionKeyRange { id, .. } => *id == pk_range.id,
                FeedRange::Epk { range } => range.overlaps(&pk_range.range),
            });
            if covered {
                continue;
            }
            if self
                .lease_manager
                .create_lease_if_not_exist(FeedRange::partition_key_range(&pk_range), None)
                .await?
                .is_some()
            {
                created += 1;
            }
        }
        debug!(created, "Missing leases created");
        Ok(created)
    }

    /// Work out how a gone lease continues
    pub async fn get_feed_range_gone_handler(&self, lease: &Lease) -> Result<FeedRangeGoneHandler> {
        let mut overlapping = self.container.get_overlapping_ranges(lease.range()).await?;
        ChangeFeedMetrics::increment_feed_ranges_gone();
        match overlapping.len() {
            0 => Err(ChangeFeedError::PartitionNotFound {
                lease_token: lease.lease_token.clone(),
            }),
            1 => {
                let successor = overlapping.remove(0);
                info!(lease_token = %lease.lease_token, successor = %successor.id, "Range merged");
                Ok(FeedRangeGoneHandler::Merge {
                    lease: lease.clone(),
                    successor,
                })
            }
            n => {
                info!(lease_token = %lease.lease_token, children = n, "Range split");
                Ok(FeedRangeGoneHandler::Split {
                    lease: lease.clone(),
                    children: overlapping,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Range;
    use crate::store::memory::{InMemoryFeedContainer, InMemoryLeaseContainer};
    use crate::store::MonitoredContainer;

    fn setup(
        partitions: usize,
    ) -> (
        Arc<InMemoryFeedContainer>,
        Arc<LeaseManager>,
        PartitionSynchronizer,
    ) {
        let feed = Arc::new(InMemoryFeedContainer::new("rid", partitions));
        let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
        let manager = Arc::new(LeaseManager::new(leases, "cf", "host-a"));
        let synchronizer = PartitionSynchronizer::new(feed.clone(), manager.clone());
        (feed, manager, synchronizer)
    }

    #[tokio::test]
    async fn test_create_missing_leases_is_idempotent() {
        let (_, manager, synchronizer) = setup(3);
        assert_eq!(synchronizer.create_missing_leases().await.unwrap(), 3);
        assert_eq!(synchronizer.create_missing_leases().await.unwrap(), 0);

        let mut tokens: Vec<String> = manager
            .get_all_leases()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.lease_token)
            .collect();
        tokens.sort();
        assert_eq!(tokens, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_key_range_lease_covers_partition() {
        let (feed, manager, synchronizer) = setup(1);
        let ranges = feed.read_partition_key_ranges().await.unwrap();
        manager
            .create_lease_if_not_exist(FeedRange::epk(ranges[0].range.clone()), None)
            .await
            .unwrap();
        assert_eq!(synchronizer.create_missing_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_split_fans_out_with_parent_continuation() {
        let (feed, manager, synchronizer) = setup(1);
        synchronizer.create_missing_leases().await.unwrap();
        let parent = manager.get_all_leases().await.unwrap().remove(0);
        let parent = manager.acquire(&parent).await.unwrap();
        let parent = manager.checkpoint(&parent, "\"7\"").await.unwrap();

        feed.split("0").unwrap();
        let handler = synchronizer.get_feed_range_gone_handler(&parent).await.unwrap();
        assert!(handler.should_delete_current_lease());

        let children = handler.handle(&manager).await.unwrap();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert!(child.feed_range.is_partition_key_range());
            assert_eq!(child.continuation_token.as_deref(), Some("\"7\""));
            assert!(child.is_unowned());
            assert!(parent.range().contains(child.range()));
        }
        assert_eq!(children[0].range().max, children[1].range().min);
    }

    #[tokio::test]
    async fn test_split_of_key_range_lease_clips_children() {
        let (feed, manager, synchronizer) = setup(1);
        let parent = manager
            .create_lease_if_not_exist(
                FeedRange::epk(Range::new("", "80000000")),
                Some("\"3\"".into()),
            )
            .await
            .unwrap()
            .unwrap();

        // Children split at 7F800000, the left one is fully inside the lease.
        feed.split("0").unwrap();
        let handler = synchronizer.get_feed_range_gone_handler(&parent).await.unwrap();
        let children = handler.handle(&manager).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| !c.feed_range.is_partition_key_range()));
        assert_eq!(children[1].range().max, "80000000");
    }

    #[tokio::test]
    async fn test_merge_resolves_to_single_successor() {
        let (feed, manager, synchronizer) = setup(2);
        synchronizer.create_missing_leases().await.unwrap();
        let lease = manager
            .get_all_leases()
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.lease_token == "0")
            .unwrap();
        let lease = manager.acquire(&lease).await.unwrap();
        let lease = manager.checkpoint(&lease, "\"4\"").await.unwrap();

        let merged = feed.merge("0", "1").unwrap();
        let handler = synchronizer.get_feed_range_gone_handler(&lease).await.unwrap();
        assert!(!handler.should_delete_current_lease());
        match &handler {
            FeedRangeGoneHandler::Merge { successor, .. } => assert_eq!(successor.id, merged),
            other => panic!("expected merge, got {other:?}"),
        }

        let resolved = handler.handle(&manager).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].lease_token, "0");
        assert_eq!(resolved[0].feed_range, FeedRange::epk(lease.range().clone()));
        assert_eq!(resolved[0].continuation_token.as_deref(), Some("\"4\""));
        // No duplicate leases appear for the merged range.
        assert_eq!(manager.get_all_leases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_overlap_is_not_found() {
        let (_, _manager, synchronizer) = setup(1);
        let lease = Lease::new("cf", FeedRange::epk(Range::new("FF", "FFFF")), None);
        let err = synchronizer.get_feed_range_gone_handler(&lease).await.unwrap_err();
        assert!(matches!(err, ChangeFeedError::PartitionNotFound { .. }));
    }
}
