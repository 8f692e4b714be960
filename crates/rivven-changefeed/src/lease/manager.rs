//! Lease lifecycle operations.

use tracing::{debug, info, warn};

use super::{Lease, LeaseUpdater, LEASE_ID_SEPARATOR};
use crate::error::{ChangeFeedError, Result, StoreError};
use crate::feed::FeedRange;
use crate::store::{QuerySpec, SharedLeaseContainer};

/// Creates, acquires, renews, checkpoints, releases and deletes leases on
/// behalf of one host.
pub struct LeaseManager {
    container: SharedLeaseContainer,
    updater: LeaseUpdater,
    prefix: String,
    host_name: String,
}

impl LeaseManager {
    pub fn new(
        container: SharedLeaseContainer,
        prefix: impl Into<String>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            updater: LeaseUpdater::new(container.clone()),
            container,
            prefix: prefix.into(),
            host_name: host_name.into(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Every lease under this prefix
    pub async fn get_all_leases(&self) -> Result<Vec<Lease>> {
        let query = QuerySpec::id_starts_with(format!("{}{}", self.prefix, LEASE_ID_SEPARATOR));
        let mut leases = Vec::new();
        let mut continuation = None;
        loop {
            let page = self.container.query_items(&query, continuation).await?;
            for item in page.items {
                leases.push(Lease::from_item(item)?);
            }
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(leases)
    }

    /// Leases currently owned by this host
    pub async fn get_owned_leases(&self) -> Result<Vec<Lease>> {
        Ok(self
            .get_all_leases()
            .await?
            .into_iter()
            .filter(|l| l.is_owned_by(&self.host_name))
            .collect())
    }

    pub async fn read_lease(&self, lease: &Lease) -> Result<Lease> {
        match self.container.read_item(&lease.id).await {
            Ok(item) => Lease::from_item(item),
            Err(StoreError::NotFound(_)) => {
                Err(ChangeFeedError::lease_lost(&lease.lease_token, None))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create an unowned lease for `feed_range`.
    ///
    /// Returns `None` if another host created it first.
    pub async fn create_lease_if_not_exist(
        &self,
        feed_range: FeedRange,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>> {
        let lease = Lease::new(&self.prefix, feed_range, continuation_token);
        match self.container.create_item(lease.to_document()?).await {
            Ok(item) => {
                info!(lease_token = %lease.lease_token, "Created lease");
                Ok(Some(Lease::from_item(item)?))
            }
            Err(StoreError::Conflict(_)) => {
                debug!(lease_token = %lease.lease_token, "Lease already exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take ownership of `lease`.
    ///
    /// Fails with `LeaseLost` if the stored owner is no longer the one the
    /// caller observed.
    pub async fn acquire(&self, lease: &Lease) -> Result<Lease> {
        let observed_owner = lease.owner.clone();
        let host = self.host_name.clone();
        let properties = lease.properties.clone();
        self.updater
            .update_lease(lease, |mut server| {
                if !server.same_owner(observed_owner.as_deref()) {
                    info!(
                        lease_token = %server.lease_token,
                        expected = observed_owner.as_deref().unwrap_or("<none>"),
                        actual = server.owner.as_deref().unwrap_or("<none>"),
                        "Lease acquired by another host"
                    );
                    return Err(ChangeFeedError::lease_lost(
                        &server.lease_token,
                        server.owner.clone(),
                    ));
                }
                server.owner = Some(host.clone());
                server.properties = properties.clone();
                Ok(server)
            })
            .await
    }

    /// Give up ownership of `lease`
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let current = match self.container.read_item(&lease.id).await {
            Ok(item) => Lease::from_item(item)?,
            Err(StoreError::NotFound(_)) => {
                info!(
                    lease_token = %lease.lease_token,
                    "Lease already deleted, nothing to release"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let owner = lease.owner.clone();
        if !current.same_owner(owner.as_deref()) {
            return Err(ChangeFeedError::lease_lost(&lease.lease_token, current.owner));
        }
        self.updater
            .update_lease(&current, |mut server| {
                if !server.same_owner(owner.as_deref()) {
                    return Err(ChangeFeedError::lease_lost(
                        &server.lease_token,
                        server.owner.clone(),
                    ));
                }
                server.owner = None;
                Ok(server)
            })
            .await?;
        Ok(())
    }

    /// Refresh the lease timestamp, proving the owner is alive
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let current = self.read_lease(lease).await?;
        let owner = lease.owner.clone();
        if !current.same_owner(owner.as_deref()) {
            info!(
                lease_token = %lease.lease_token,
                owner = current.owner.as_deref().unwrap_or("<none>"),
                "Lease was taken over"
            );
            return Err(ChangeFeedError::lease_lost(&lease.lease_token, current.owner));
        }
        self.updater
            .update_lease(&current, |server| {
                if !server.same_owner(owner.as_deref()) {
                    return Err(ChangeFeedError::lease_lost(
                        &server.lease_token,
                        server.owner.clone(),
                    ));
                }
                Ok(server)
            })
            .await
    }

    /// Record progress for `lease`
    pub async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> Result<Lease> {
        let current = self.read_lease(lease).await?;
        let owner = lease.owner.clone();
        if !current.same_owner(owner.as_deref()) {
            return Err(ChangeFeedError::lease_lost(&lease.lease_token, current.owner));
        }
        let token = continuation_token.to_string();
        self.updater
            .update_lease(&current, |mut server| {
                if !server.same_owner(owner.as_deref()) {
                    return Err(ChangeFeedError::lease_lost(
                        &server.lease_token,
                        server.owner.clone(),
                    ));
                }
                server.continuation_token = Some(token.clone());
                Ok(server)
            })
            .await
    }

    /// Push the caller's property bag to the stored lease
    pub async fn update_properties(&self, lease: &Lease) -> Result<Lease> {
        if !lease.is_owned_by(&self.host_name) {
            return Err(ChangeFeedError::lease_lost(&lease.lease_token, lease.owner.clone()));
        }
        let host = self.host_name.clone();
        let properties = lease.properties.clone();
        self.updater
            .update_lease(lease, |mut server| {
                if !server.is_owned_by(&host) {
                    return Err(ChangeFeedError::lease_lost(
                        &server.lease_token,
                        server.owner.clone(),
                    ));
                }
                server.properties = properties.clone();
                Ok(server)
            })
            .await
    }

    /// Re-bind an owned lease to a different feed range
    pub async fn update_feed_range(&self, lease: &Lease, feed_range: FeedRange) -> Result<Lease> {
        let host = self.host_name.clone();
        self.updater
            .update_lease(lease, |mut server| {
                if !server.is_owned_by(&host) {
                    return Err(ChangeFeedError::lease_lost(
                        &server.lease_token,
                        server.owner.clone(),
                    ));
                }
                server.feed_range = feed_range.clone();
                Ok(server)
            })
            .await
    }

    /// Remove the lease document. A missing document counts as deleted.
    pub async fn delete(&self, lease: &Lease) -> Result<()> {
        match self.container.delete_item(&lease.id, None).await {
            Ok(()) => {
                info!(lease_token = %lease.lease_token, "Deleted lease");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                warn!(lease_token = %lease.lease_token, "Lease already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{PartitionKeyRange, Range};
    use crate::store::memory::InMemoryLeaseContainer;
    use crate::store::LeaseContainer;
    use std::sync::Arc;

    fn pk_range(id: &str) -> FeedRange {
        FeedRange::partition_key_range(&PartitionKeyRange::new(id, Range::full()))
    }

    fn managers() -> (Arc<InMemoryLeaseContainer>, LeaseManager, LeaseManager) {
        let container = Arc::new(InMemoryLeaseContainer::new("leases"));
        let a = LeaseManager::new(container.clone(), "cf", "host-a");
        let b = LeaseManager::new(container.clone(), "cf", "host-b");
        (container, a, b)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_, a, b) = managers();
        assert!(a.create_lease_if_not_exist(pk_range("0"), None).await.unwrap().is_some());
        assert!(b.create_lease_if_not_exist(pk_range("0"), None).await.unwrap().is_none());
        assert_eq!(a.get_all_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_owner_under_contention() {
        let (_, a, b) = managers();
        let lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();

        // Both hosts saw the same unowned snapshot.
        let (ra, rb) = tokio::join!(a.acquire(&lease), b.acquire(&lease));
        let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
        let loser = if ra.is_ok() { rb } else { ra };
        assert!(loser.unwrap_err().is_lease_lost());

        let stored = a.get_all_leases().await.unwrap();
        assert!(stored[0].owner.is_some());
    }

    #[tokio::test]
    async fn test_acquire_carries_properties() {
        let (_, a, _) = managers();
        let mut lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();
        lease.properties.insert("k".into(), "v".into());
        let acquired = a.acquire(&lease).await.unwrap();
        assert!(acquired.is_owned_by("host-a"));
        assert_eq!(acquired.properties.get("k").map(String::as_str), Some("v"));
        assert_eq!(a.get_owned_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renew_is_idempotent_until_stolen() {
        let (_, a, b) = managers();
        let lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();
        let owned = a.acquire(&lease).await.unwrap();

        let first = a.renew(&owned).await.unwrap();
        let second = a.renew(&first).await.unwrap();
        assert!(second.is_owned_by("host-a"));
        assert_ne!(first.concurrency_token, second.concurrency_token);
        assert!(second.timestamp >= first.timestamp);

        b.acquire(&second).await.unwrap();
        assert!(a.renew(&second).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_checkpoint_after_owner_change_is_rejected() {
        let (container, a, _) = managers();
        let lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();
        let owned = a.acquire(&lease).await.unwrap();
        let owned = a.checkpoint(&owned, "tok-1").await.unwrap();
        assert_eq!(owned.continuation_token.as_deref(), Some("tok-1"));

        // Out-of-band ownership change.
        let mut stolen = owned.clone();
        stolen.owner = Some("host-z".into());
        container
            .replace_item(&stolen.id, stolen.to_document().unwrap(), None)
            .await
            .unwrap();

        let err = a.checkpoint(&owned, "tok-2").await.unwrap_err();
        assert!(err.is_lease_lost());
        let stored = Lease::from_item(container.read_item(&owned.id).await.unwrap()).unwrap();
        assert_eq!(stored.continuation_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_checkpoints_keep_latest_value() {
        let (_, a, _) = managers();
        let lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();
        let mut owned = a.acquire(&lease).await.unwrap();
        for token in ["\"1\"", "\"2\"", "\"3\""] {
            owned = a.checkpoint(&owned, token).await.unwrap();
        }
        // A renew from a stale snapshot does not roll the continuation back.
        let renewed = a.renew(&lease_with_owner(&lease, "host-a")).await.unwrap();
        assert_eq!(renewed.continuation_token.as_deref(), Some("\"3\""));
    }

    fn lease_with_owner(lease: &Lease, owner: &str) -> Lease {
        let mut l = lease.clone();
        l.owner = Some(owner.into());
        l
    }

    #[tokio::test]
    async fn test_release_and_delete() {
        let (_, a, b) = managers();
        let lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();
        let owned = a.acquire(&lease).await.unwrap();

        assert!(b.release(&lease_with_owner(&owned, "host-b")).await.unwrap_err().is_lease_lost());
        a.release(&owned).await.unwrap();
        assert!(a.get_owned_leases().await.unwrap().is_empty());

        a.delete(&owned).await.unwrap();
        a.delete(&owned).await.unwrap();
        a.release(&owned).await.unwrap();
        assert!(a.get_all_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_properties_requires_ownership() {
        let (_, a, _) = managers();
        let lease = a
            .create_lease_if_not_exist(pk_range("0"), None)
            .await
            .unwrap()
            .unwrap();
        assert!(a.update_properties(&lease).await.unwrap_err().is_lease_lost());

        let mut owned = a.acquire(&lease).await.unwrap();
        owned.properties.insert("x".into(), "1".into());
        let updated = a.update_properties(&owned).await.unwrap();
        assert_eq!(updated.properties.get("x").map(String::as_str), Some("1"));
    }
}
