//! Initialization marker and bootstrap lock.

use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::store::SharedLeaseContainer;

/// Sentinel documents guarding one-time lease creation.
///
/// `<prefix>.info` marks the lease inventory as initialized and
/// `<prefix>.lock` is a TTL'd document only one host can create at a time.
pub struct LeaseStore {
    container: SharedLeaseContainer,
    prefix: String,
    lock_etag: Mutex<Option<String>>,
}

impl LeaseStore {
    pub fn new(container: SharedLeaseContainer, prefix: impl Into<String>) -> Self {
        Self {
            container,
            prefix: prefix.into(),
            lock_etag: Mutex::new(None),
        }
    }

    fn marker_id(&self) -> String {
        format!("{}.info", self.prefix)
    }

    fn lock_id(&self) -> String {
        format!("{}.lock", self.prefix)
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        match self.container.read_item(&self.marker_id()).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn mark_initialized(&self) -> Result<()> {
        match self.container.create_item(json!({ "id": self.marker_id() })).await {
            Ok(_) => {
                info!(prefix = %self.prefix, "Lease store marked initialized");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Try to take the bootstrap lock for `ttl`. Returns whether it was taken.
    pub async fn acquire_initialization_lock(&self, ttl: Duration) -> Result<bool> {
        let document = json!({
            "id": self.lock_id(),
            "ttl": ttl.as_secs().max(1),
        });
        match self.container.create_item(document).await {
            Ok(item) => {
                debug!(prefix = %self.prefix, "Acquired initialization lock");
                *self.lock_etag.lock() = Some(item.etag);
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(prefix = %self.prefix, "Initialization lock held by another host");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock taken by this instance. Returns whether it was released.
    pub async fn release_initialization_lock(&self) -> Result<bool> {
        let etag = self.lock_etag.lock().take();
        let Some(etag) = etag else {
            return Ok(false);
        };
        match self.container.delete_item(&self.lock_id(), Some(&etag)).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) | Err(StoreError::PreconditionFailed(_)) => {
                warn!(prefix = %self.prefix, "Initialization lock expired before release");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
