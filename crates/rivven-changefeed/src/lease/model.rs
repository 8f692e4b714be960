use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ChangeFeedError, Result};
use crate::feed::{FeedRange, Range};
use crate::store::StoredItem;

/// Separator between the lease prefix and the lease token in document ids
pub const LEASE_ID_SEPARATOR: &str = "..";

/// Durable record of which host owns a partition and how far it has read.
///
/// Stored as one JSON document per partition in the lease container. The
/// concurrency token is filled in from the store on every read and write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,

    #[serde(rename = "_etag", default, skip_serializing)]
    pub concurrency_token: Option<String>,

    #[serde(rename = "LeaseToken")]
    pub lease_token: String,

    #[serde(rename = "FeedRange")]
    pub feed_range: FeedRange,

    #[serde(rename = "Owner", default)]
    pub owner: Option<String>,

    #[serde(rename = "ContinuationToken", default)]
    pub continuation_token: Option<String>,

    #[serde(rename = "timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "properties", default)]
    pub properties: HashMap<String, String>,
}

impl Lease {
    /// New unowned lease for `feed_range`
    pub fn new(prefix: &str, feed_range: FeedRange, continuation_token: Option<String>) -> Self {
        let lease_token = feed_range.lease_token();
        Self {
            id: Self::document_id(prefix, &lease_token),
            concurrency_token: None,
            lease_token,
            feed_range,
            owner: None,
            continuation_token,
            timestamp: Utc::now(),
            properties: HashMap::new(),
        }
    }

    /// Document id of the lease for `lease_token`
    pub fn document_id(prefix: &str, lease_token: &str) -> String {
        format!("{prefix}{LEASE_ID_SEPARATOR}{lease_token}")
    }

    pub fn from_item(item: StoredItem) -> Result<Self> {
        let mut lease: Lease = serde_json::from_value(item.document).map_err(|e| {
            ChangeFeedError::Serialization(format!("invalid lease document: {e}"))
        })?;
        lease.concurrency_token = Some(item.etag);
        Ok(lease)
    }

    pub fn to_document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn range(&self) -> &Range {
        self.feed_range.range()
    }

    /// Case-insensitive owner check
    pub fn is_owned_by(&self, host_name: &str) -> bool {
        self.owner
            .as_deref()
            .map(|o| o.eq_ignore_ascii_case(host_name))
            .unwrap_or(false)
    }

    /// Whether `other` names the same owner as this lease (both unowned counts)
    pub fn same_owner(&self, other: Option<&str>) -> bool {
        match (self.owner.as_deref(), other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    pub fn is_unowned(&self) -> bool {
        self.owner.as_deref().map(str::is_empty).unwrap_or(true)
    }

    /// Unowned, or not renewed within `expiration`
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        if self.is_unowned() {
            return true;
        }
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => now - self.timestamp > expiration,
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (owner: {})",
            self.lease_token,
            self.owner.as_deref().unwrap_or("<none>")
        )
    }
}
