//! Optimistic-concurrency read-modify-write of lease documents.

use chrono::Utc;
use tracing::{debug, warn};

use super::Lease;
use crate::error::{ChangeFeedError, Result, StoreError};
use crate::store::SharedLeaseContainer;

/// Replace attempts before giving up on a contended lease
pub const RETRY_COUNT_ON_CONFLICT: usize = 5;

/// Applies mutations to lease documents with conditional replaces.
///
/// The mutation is applied to the cached copy first. When the replace loses
/// against a concurrent writer the server copy is re-read and the mutation
/// applied again; mutations enforce their own ownership rules by returning
/// [`ChangeFeedError::LeaseLost`].
#[derive(Clone)]
pub struct LeaseUpdater {
    container: SharedLeaseContainer,
}

impl LeaseUpdater {
    pub fn new(container: SharedLeaseContainer) -> Self {
        Self { container }
    }

    /// Mutate a lease.
    ///
    /// Returns the stored lease on success. If every attempt conflicts, the
    /// cached lease is returned unchanged and the update is dropped.
    pub async fn update_lease<F>(&self, cached: &Lease, mutate: F) -> Result<Lease>
    where
        F: Fn(Lease) -> Result<Lease> + Send + Sync,
    {
        let mut lease = cached.clone();
        for attempt in 1..=RETRY_COUNT_ON_CONFLICT {
            let mut candidate = mutate(lease)?;
            candidate.timestamp = Utc::now();

            match self.try_replace(&candidate).await {
                Ok(updated) => return Ok(updated),
                Err(ChangeFeedError::LeaseConflict { .. }) => {
                    debug!(
                        lease_token = %candidate.lease_token,
                        attempt,
                        "Lease changed concurrently, re-reading"
                    );
                    lease = self.read(&candidate).await?;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            lease_token = %cached.lease_token,
            attempts = RETRY_COUNT_ON_CONFLICT,
            "Giving up on lease update after repeated conflicts"
        );
        Ok(cached.clone())
    }

    async fn try_replace(&self, lease: &Lease) -> Result<Lease> {
        let document = lease.to_document()?;
        match self
            .container
            .replace_item(&lease.id, document, lease.concurrency_token.as_deref())
            .await
        {
            Ok(item) => Lease::from_item(item),
            Err(StoreError::PreconditionFailed(_)) => Err(ChangeFeedError::LeaseConflict {
                lease_token: lease.lease_token.clone(),
            }),
            Err(StoreError::NotFound(_)) | Err(StoreError::Conflict(_)) => {
                Err(ChangeFeedError::lease_lost(&lease.lease_token, None))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, lease: &Lease) -> Result<Lease> {
        match self.container.read_item(&lease.id).await {
            Ok(item) => Lease::from_item(item),
            Err(StoreError::NotFound(_)) => {
                Err(ChangeFeedError::lease_lost(&lease.lease_token, None))
            }
            Err(e) => Err(e.into()),
        }
    }
}
