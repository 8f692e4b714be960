//! Document store seams.
//!
//! The engine talks to two containers:
//!
//! - a **lease container** holding one JSON document per partition lease plus
//!   a couple of sentinel documents, written with optimistic concurrency
//! - a **monitored container** whose change feed is being consumed
//!
//! Both are traits so that any document store can be plugged in. The
//! [`memory`] module provides in-process implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::error::StoreResult;
use crate::feed::{FeedRange, PartitionKeyRange, Range};

/// Partition key path the lease container must be configured with
pub const LEASE_PARTITION_KEY_PATH: &str = "/id";

/// A document together with its concurrency token
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub document: Value,
    pub etag: String,
}

/// Prefix scan over the lease container.
///
/// The engine only ever lists documents by id prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub id_prefix: String,
    pub max_item_count: Option<u32>,
}

impl QuerySpec {
    pub fn id_starts_with(prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: prefix.into(),
            max_item_count: None,
        }
    }

    /// SQL text and parameters for stores that accept queries
    pub fn to_sql(&self) -> (String, Vec<(String, Value)>) {
        (
            "SELECT * FROM c WHERE STARTSWITH(c.id, @PartitionLeasePrefix)".to_string(),
            vec![(
                "@PartitionLeasePrefix".to_string(),
                Value::String(self.id_prefix.clone()),
            )],
        )
    }
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<StoredItem>,
    pub continuation: Option<String>,
}

/// Where a change feed request starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStart {
    Beginning,
    Now,
    PointInTime(DateTime<Utc>),
    /// Resume after a server continuation
    IfNoneMatch(String),
}

/// A single change feed read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedRequest {
    pub feed_range: FeedRange,
    pub start: RequestStart,
    pub max_item_count: u32,
}

/// Result of a change feed read
#[derive(Debug, Clone, Default)]
pub struct ChangeFeedPage {
    pub documents: Vec<Value>,
    /// Server continuation after this page
    pub continuation: String,
    pub request_charge: f64,
    pub session_token: Option<String>,
    pub activity_id: String,
}

impl ChangeFeedPage {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Container holding the leases
#[async_trait]
pub trait LeaseContainer: Send + Sync {
    /// Container name, for logs
    fn name(&self) -> &str;

    /// Partition key path the container was created with
    fn partition_key_path(&self) -> &str;

    /// Create a document; fails with `Conflict` if the id exists
    async fn create_item(&self, document: Value) -> StoreResult<StoredItem>;

    async fn read_item(&self, id: &str) -> StoreResult<StoredItem>;

    /// Replace a document, conditionally on `if_match`
    async fn replace_item(
        &self,
        id: &str,
        document: Value,
        if_match: Option<&str>,
    ) -> StoreResult<StoredItem>;

    async fn delete_item(&self, id: &str, if_match: Option<&str>) -> StoreResult<()>;

    async fn query_items(
        &self,
        query: &QuerySpec,
        continuation: Option<String>,
    ) -> StoreResult<QueryPage>;
}

/// Container whose change feed is consumed
#[async_trait]
pub trait MonitoredContainer: Send + Sync {
    /// Resource id of the container
    async fn container_rid(&self) -> StoreResult<String>;

    /// Current physical partitions
    async fn read_partition_key_ranges(&self) -> StoreResult<Vec<PartitionKeyRange>>;

    /// Current physical partitions overlapping `range`
    async fn get_overlapping_ranges(&self, range: &Range) -> StoreResult<Vec<PartitionKeyRange>>;

    async fn read_change_feed(&self, request: &ChangeFeedRequest) -> StoreResult<ChangeFeedPage>;
}

/// Shared lease container handle
pub type SharedLeaseContainer = Arc<dyn LeaseContainer>;

/// Shared monitored container handle
pub type SharedMonitoredContainer = Arc<dyn MonitoredContainer>;
