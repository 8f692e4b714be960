//! In-memory containers.
//!
//! [`InMemoryLeaseContainer`] honours etags and document `ttl` the way a real
//! document store does. [`InMemoryFeedContainer`] keeps an LSN-ordered change
//! log per physical partition and can split and merge partitions while
//! readers are active. Both are used by the tests and by the `simulate`
//! command, and are fine for single-process embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    ChangeFeedPage, ChangeFeedRequest, LeaseContainer, MonitoredContainer, QueryPage, QuerySpec,
    RequestStart, StoredItem, LEASE_PARTITION_KEY_PATH,
};
use crate::error::{GoneReason, StoreError, StoreResult};
use crate::feed::{FeedRange, PartitionKeyRange, Range, MAX_EXCLUSIVE, MIN_INCLUSIVE};

// ============================================================================
// Lease container
// ============================================================================

struct LeaseEntry {
    document: Value,
    etag: String,
    expires_at: Option<Instant>,
}

impl LeaseEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    fn to_item(&self) -> StoredItem {
        StoredItem {
            document: self.document.clone(),
            etag: self.etag.clone(),
        }
    }
}

#[derive(Default)]
struct LeaseInner {
    items: BTreeMap<String, LeaseEntry>,
    next_etag: u64,
}

impl LeaseInner {
    fn live(&mut self, id: &str) -> Option<&mut LeaseEntry> {
        let now = Instant::now();
        if self.items.get(id).map(|e| e.is_expired(now)).unwrap_or(false) {
            self.items.remove(id);
        }
        self.items.get_mut(id)
    }

    fn stamp(&mut self, mut document: Value) -> LeaseEntry {
        self.next_etag += 1;
        let etag = format!("\"{:08x}\"", self.next_etag);
        let expires_at = document
            .get("ttl")
            .and_then(Value::as_u64)
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        if let Value::Object(map) = &mut document {
            map.insert("_etag".to_string(), Value::String(etag.clone()));
            map.insert("_ts".to_string(), Value::from(Utc::now().timestamp()));
        }
        LeaseEntry {
            document,
            etag,
            expires_at,
        }
    }
}

/// Lease container kept in process memory
pub struct InMemoryLeaseContainer {
    name: String,
    partition_key_path: String,
    inner: Mutex<LeaseInner>,
}

impl InMemoryLeaseContainer {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_partition_key_path(name, LEASE_PARTITION_KEY_PATH)
    }

    pub fn with_partition_key_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key_path: path.into(),
            inner: Mutex::new(LeaseInner::default()),
        }
    }

    /// Ids of all live documents
    pub fn ids(&self) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .lock()
            .items
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn document_id(document: &Value) -> StoreResult<String> {
    document
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Other {
            status: 400,
            message: "document has no string 'id'".to_string(),
        })
}

#[async_trait]
impl LeaseContainer for InMemoryLeaseContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_key_path(&self) -> &str {
        &self.partition_key_path
    }

    async fn create_item(&self, document: Value) -> StoreResult<StoredItem> {
        let id = document_id(&document)?;
        let mut inner = self.inner.lock();
        if inner.live(&id).is_some() {
            return Err(StoreError::Conflict(id));
        }
        let entry = inner.stamp(document);
        let item = entry.to_item();
        inner.items.insert(id, entry);
        Ok(item)
    }

    async fn read_item(&self, id: &str) -> StoreResult<StoredItem> {
        let mut inner = self.inner.lock();
        inner
            .live(id)
            .map(|e| e.to_item())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn replace_item(
        &self,
        id: &str,
        document: Value,
        if_match: Option<&str>,
    ) -> StoreResult<StoredItem> {
        let mut inner = self.inner.lock();
        let current = inner
            .live(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(expected) = if_match {
            if current.etag != expected {
                return Err(StoreError::PreconditionFailed(id.to_string()));
            }
        }
        let entry = inner.stamp(document);
        let item = entry.to_item();
        inner.items.insert(id.to_string(), entry);
        Ok(item)
    }

    async fn delete_item(&self, id: &str, if_match: Option<&str>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let current = inner
            .live(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(expected) = if_match {
            if current.etag != expected {
                return Err(StoreError::PreconditionFailed(id.to_string()));
            }
        }
        inner.items.remove(id);
        Ok(())
    }

    async fn query_items(
        &self,
        query: &QuerySpec,
        continuation: Option<String>,
    ) -> StoreResult<QueryPage> {
        let skip = match continuation {
            Some(c) => c.parse::<usize>().map_err(|_| StoreError::Other {
                status: 400,
                message: format!("invalid query continuation '{c}'"),
            })?,
            None => 0,
        };
        let now = Instant::now();
        let inner = self.inner.lock();
        let matching: Vec<StoredItem> = inner
            .items
            .iter()
            .filter(|(id, e)| id.starts_with(&query.id_prefix) && !e.is_expired(now))
            .map(|(_, e)| e.to_item())
            .collect();
        let page_size = query.max_item_count.map(|n| n as usize).unwrap_or(usize::MAX);
        let items: Vec<StoredItem> = matching.iter().skip(skip).take(page_size).cloned().collect();
        let next = skip + items.len();
        Ok(QueryPage {
            items,
            continuation: (next < matching.len()).then(|| next.to_string()),
        })
    }
}

// ============================================================================
// Monitored container
// ============================================================================

/// Width of the numeric key space backing generated effective partition keys
const KEY_SPACE: u64 = 0xFF00_0000;

fn epk_to_number(epk: &str) -> u64 {
    if epk.is_empty() {
        return 0;
    }
    if epk == MAX_EXCLUSIVE {
        return KEY_SPACE;
    }
    let digits: String = epk.chars().chain(std::iter::repeat('0')).take(8).collect();
    u64::from_str_radix(&digits, 16).unwrap_or(0)
}

fn number_to_epk(n: u64) -> String {
    if n == 0 {
        MIN_INCLUSIVE.to_string()
    } else if n >= KEY_SPACE {
        MAX_EXCLUSIVE.to_string()
    } else {
        format!("{:08X}", n)
    }
}

/// Effective partition key of a logical partition key
pub fn effective_partition_key(partition_key: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    partition_key.hash(&mut hasher);
    format!("{:08X}", hasher.finish() % KEY_SPACE)
}

fn format_lsn(lsn: u64) -> String {
    format!("\"{}\"", lsn)
}

fn parse_lsn(token: &str) -> StoreResult<u64> {
    token
        .trim_matches('"')
        .parse::<u64>()
        .map_err(|_| StoreError::Other {
            status: 400,
            message: format!("invalid continuation '{token}'"),
        })
}

#[derive(Clone)]
struct Change {
    lsn: u64,
    epk: String,
    timestamp: DateTime<Utc>,
    document: Value,
}

struct Partition {
    pk_range: PartitionKeyRange,
    changes: Vec<Change>,
}

/// Most recent reads kept by [`InMemoryFeedContainer::requests`]
pub const REQUEST_LOG_CAPACITY: usize = 1024;

/// A change feed request as the container saw it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: ChangeFeedRequest,
    pub at: Instant,
}

struct FeedInner {
    partitions: Vec<Partition>,
    retired: HashSet<String>,
    next_range_id: u64,
    lsn: u64,
    faults: VecDeque<StoreError>,
    page_size_limit: Option<u32>,
    requests: VecDeque<RecordedRequest>,
}

impl FeedInner {
    fn position(&self, range_id: &str) -> StoreResult<usize> {
        self.partitions
            .iter()
            .position(|p| p.pk_range.id == range_id)
            .ok_or_else(|| StoreError::NotFound(format!("partition key range {range_id}")))
    }

    fn allocate_id(&mut self) -> String {
        let id = self.next_range_id.to_string();
        self.next_range_id += 1;
        id
    }

    fn sort(&mut self) {
        self.partitions
            .sort_by(|a, b| a.pk_range.range.min.cmp(&b.pk_range.range.min));
    }
}

/// Partitioned change log kept in process memory
pub struct InMemoryFeedContainer {
    rid: String,
    inner: Mutex<FeedInner>,
}

impl InMemoryFeedContainer {
    /// Container with `partition_count` evenly sized partitions
    pub fn new(rid: impl Into<String>, partition_count: usize) -> Self {
        let count = partition_count.max(1) as u64;
        let partitions = (0..count)
            .map(|i| Partition {
                pk_range: PartitionKeyRange::new(
                    i.to_string(),
                    Range::new(
                        number_to_epk(KEY_SPACE * i / count),
                        number_to_epk(KEY_SPACE * (i + 1) / count),
                    ),
                ),
                changes: Vec::new(),
            })
            .collect();
        Self {
            rid: rid.into(),
            inner: Mutex::new(FeedInner {
                partitions,
                retired: HashSet::new(),
                next_range_id: count,
                lsn: 0,
                faults: VecDeque::new(),
                page_size_limit: None,
                requests: VecDeque::with_capacity(REQUEST_LOG_CAPACITY),
            }),
        }
    }

    /// Record a document change under a logical partition key. Returns its LSN.
    pub fn upsert(&self, partition_key: &str, document: Value) -> u64 {
        self.upsert_with_epk(&effective_partition_key(partition_key), document)
    }

    /// Record a document change at an explicit effective partition key
    pub fn upsert_with_epk(&self, epk: &str, mut document: Value) -> u64 {
        let mut inner = self.inner.lock();
        inner.lsn += 1;
        let lsn = inner.lsn;
        let timestamp = Utc::now();
        if let Value::Object(map) = &mut document {
            map.insert("_lsn".to_string(), Value::from(lsn));
            map.insert("_ts".to_string(), Value::from(timestamp.timestamp()));
        }
        let change = Change {
            lsn,
            epk: epk.to_string(),
            timestamp,
            document,
        };
        if let Some(partition) = inner
            .partitions
            .iter_mut()
            .find(|p| p.pk_range.range.contains_key(epk))
        {
            partition.changes.push(change);
        }
        lsn
    }

    /// Split a partition at the midpoint of its range. Returns the child ids.
    pub fn split(&self, range_id: &str) -> StoreResult<(String, String)> {
        let mut inner = self.inner.lock();
        let index = inner.position(range_id)?;
        let parent = inner.partitions.remove(index);
        let min = epk_to_number(&parent.pk_range.range.min);
        let max = epk_to_number(&parent.pk_range.range.max);
        let mid = number_to_epk(min + (max - min) / 2);

        let left_range = Range::new(parent.pk_range.range.min.clone(), mid.clone());
        let right_range = Range::new(mid, parent.pk_range.range.max.clone());
        let (left_changes, right_changes): (Vec<Change>, Vec<Change>) = parent
            .changes
            .into_iter()
            .partition(|c| left_range.contains_key(&c.epk));

        let left_id = inner.allocate_id();
        let right_id = inner.allocate_id();
        for (id, range, changes) in [
            (left_id.clone(), left_range, left_changes),
            (right_id.clone(), right_range, right_changes),
        ] {
            let mut pk_range = PartitionKeyRange::new(id, range);
            pk_range.parents = vec![range_id.to_string()];
            inner.partitions.push(Partition { pk_range, changes });
        }
        inner.retired.insert(range_id.to_string());
        inner.sort();
        Ok((left_id, right_id))
    }

    /// Merge two adjacent partitions. Returns the merged id.
    pub fn merge(&self, left_id: &str, right_id: &str) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        let left_index = inner.position(left_id)?;
        let right_index = inner.position(right_id)?;
        if inner.partitions[left_index].pk_range.range.max
            != inner.partitions[right_index].pk_range.range.min
        {
            return Err(StoreError::Other {
                status: 400,
                message: format!("ranges {left_id} and {right_id} are not adjacent"),
            });
        }
        let (first, second) = if left_index > right_index {
            (left_index, right_index)
        } else {
            (right_index, left_index)
        };
        let a = inner.partitions.remove(first);
        let b = inner.partitions.remove(second);
        let (left, right) = if a.pk_range.id == left_id { (a, b) } else { (b, a) };

        let mut changes = left.changes;
        changes.extend(right.changes);
        changes.sort_by_key(|c| c.lsn);

        let id = inner.allocate_id();
        let mut pk_range = PartitionKeyRange::new(
            id.clone(),
            Range::new(left.pk_range.range.min, right.pk_range.range.max),
        );
        pk_range.parents = vec![left_id.to_string(), right_id.to_string()];
        inner.partitions.push(Partition { pk_range, changes });
        inner.retired.insert(left_id.to_string());
        inner.retired.insert(right_id.to_string());
        inner.sort();
        Ok(id)
    }

    /// Fail the next change feed read with `error`
    pub fn inject_fault(&self, error: StoreError) {
        self.inner.lock().faults.push_back(error);
    }

    /// Reject reads asking for more than `limit` items
    pub fn set_page_size_limit(&self, limit: Option<u32>) {
        self.inner.lock().page_size_limit = limit;
    }

    /// The latest change feed reads, oldest first
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().requests.iter().cloned().collect()
    }

    pub fn current_lsn(&self) -> u64 {
        self.inner.lock().lsn
    }
}

#[async_trait]
impl MonitoredContainer for InMemoryFeedContainer {
    async fn container_rid(&self) -> StoreResult<String> {
        Ok(self.rid.clone())
    }

    async fn read_partition_key_ranges(&self) -> StoreResult<Vec<PartitionKeyRange>> {
        Ok(self
            .inner
            .lock()
            .partitions
            .iter()
            .map(|p| p.pk_range.clone())
            .collect())
    }

    async fn get_overlapping_ranges(&self, range: &Range) -> StoreResult<Vec<PartitionKeyRange>> {
        Ok(self
            .inner
            .lock()
            .partitions
            .iter()
            .filter(|p| p.pk_range.range.overlaps(range))
            .map(|p| p.pk_range.clone())
            .collect())
    }

    async fn read_change_feed(&self, request: &ChangeFeedRequest) -> StoreResult<ChangeFeedPage> {
        let mut inner = self.inner.lock();
        if inner.requests.len() == REQUEST_LOG_CAPACITY {
            inner.requests.pop_front();
        }
        inner.requests.push_back(RecordedRequest {
            request: request.clone(),
            at: Instant::now(),
        });
        if let Some(fault) = inner.faults.pop_front() {
            return Err(fault);
        }
        if let Some(limit) = inner.page_size_limit {
            if request.max_item_count > limit {
                return Err(StoreError::MaxItemCountTooLarge(request.max_item_count));
            }
        }

        let (partition, filter) = match &request.feed_range {
            FeedRange::PartitionKeyRange { id, .. } => {
                match inner.partitions.iter().find(|p| &p.pk_range.id == id) {
                    Some(p) => (p, None),
                    None if inner.retired.contains(id) => {
                        return Err(StoreError::Gone {
                            reason: GoneReason::PartitionKeyRangeGone,
                        })
                    }
                    None => return Err(StoreError::NotFound(format!("partition key range {id}"))),
                }
            }
            FeedRange::Epk { range } => {
                let overlapping: Vec<&Partition> = inner
                    .partitions
                    .iter()
                    .filter(|p| p.pk_range.range.overlaps(range))
                    .collect();
                match overlapping.as_slice() {
                    [] => return Err(StoreError::NotFound(format!("feed range {range}"))),
                    [single] => (*single, Some(range.clone())),
                    _ => {
                        return Err(StoreError::Gone {
                            reason: GoneReason::PartitionKeyRangeGone,
                        })
                    }
                }
            }
        };

        let (after_lsn, not_before) = match &request.start {
            RequestStart::Beginning => (0, None),
            RequestStart::Now => (inner.lsn, None),
            RequestStart::PointInTime(t) => (0, Some(*t)),
            RequestStart::IfNoneMatch(token) => (parse_lsn(token)?, None),
        };

        let documents: Vec<Change> = partition
            .changes
            .iter()
            .filter(|c| c.lsn > after_lsn)
            .filter(|c| not_before.map(|t| c.timestamp >= t).unwrap_or(true))
            .filter(|c| filter.as_ref().map(|r| r.contains_key(&c.epk)).unwrap_or(true))
            .take(request.max_item_count as usize)
            .cloned()
            .collect();

        let continuation = match documents.last() {
            Some(last) => format_lsn(last.lsn),
            None => format_lsn(inner.lsn.max(after_lsn)),
        };
        Ok(ChangeFeedPage {
            request_charge: 1.0 + documents.len() as f64,
            documents: documents.into_iter().map(|c| c.document).collect(),
            continuation,
            session_token: Some(format!("0:{}", inner.lsn)),
            activity_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lease_container_etag_checks() {
        let container = InMemoryLeaseContainer::new("leases");
        let created = container.create_item(json!({"id": "a"})).await.unwrap();
        assert!(matches!(
            container.create_item(json!({"id": "a"})).await,
            Err(StoreError::Conflict(_))
        ));

        let replaced = container
            .replace_item("a", json!({"id": "a", "v": 1}), Some(&created.etag))
            .await
            .unwrap();
        assert_ne!(replaced.etag, created.etag);
        assert_eq!(replaced.document["_etag"], replaced.etag.as_str());

        let stale = container
            .replace_item("a", json!({"id": "a", "v": 2}), Some(&created.etag))
            .await;
        assert!(matches!(stale, Err(StoreError::PreconditionFailed(_))));

        container.delete_item("a", None).await.unwrap();
        assert!(matches!(
            container.read_item("a").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_container_ttl_expiry() {
        let container = InMemoryLeaseContainer::new("leases");
        container
            .create_item(json!({"id": "lock", "ttl": 10}))
            .await
            .unwrap();
        assert!(container.read_item("lock").await.is_ok());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(container.read_item("lock").await.is_err());
        container
            .create_item(json!({"id": "lock", "ttl": 10}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_query_pages_by_prefix() {
        let container = InMemoryLeaseContainer::new("leases");
        for id in ["p..0", "p..1", "p..2", "p.info", "q..0"] {
            container.create_item(json!({ "id": id })).await.unwrap();
        }
        let mut query = QuerySpec::id_starts_with("p..");
        query.max_item_count = Some(2);

        let first = container.query_items(&query, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second = container
            .query_items(&query, first.continuation.clone())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn test_feed_reads_in_lsn_order() {
        let feed = InMemoryFeedContainer::new("rid", 1);
        for i in 0..5 {
            feed.upsert("pk", json!({ "id": i.to_string() }));
        }
        let request = ChangeFeedRequest {
            feed_range: FeedRange::partition_key_range(&PartitionKeyRange::new("0", Range::full())),
            start: RequestStart::Beginning,
            max_item_count: 3,
        };
        let page = feed.read_change_feed(&request).await.unwrap();
        assert_eq!(page.documents.len(), 3);
        assert_eq!(page.continuation, "\"3\"");

        let next = ChangeFeedRequest {
            start: RequestStart::IfNoneMatch(page.continuation),
            ..request
        };
        let page = feed.read_change_feed(&next).await.unwrap();
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.documents[0]["id"], "3");
    }

    #[tokio::test]
    async fn test_split_retires_parent_range() {
        let feed = InMemoryFeedContainer::new("rid", 1);
        feed.upsert_with_epk("10000000", json!({"id": "left"}));
        feed.upsert_with_epk("F0000000", json!({"id": "right"}));

        let (left, right) = feed.split("0").unwrap();
        let ranges = feed.read_partition_key_ranges().await.unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].id, left);
        assert_eq!(ranges[1].id, right);
        assert_eq!(ranges[0].range.max, ranges[1].range.min);

        let gone = feed
            .read_change_feed(&ChangeFeedRequest {
                feed_range: FeedRange::PartitionKeyRange {
                    id: "0".into(),
                    range: Range::full(),
                },
                start: RequestStart::Beginning,
                max_item_count: 10,
            })
            .await;
        assert!(matches!(gone, Err(StoreError::Gone { .. })));

        let epk_full = feed
            .read_change_feed(&ChangeFeedRequest {
                feed_range: FeedRange::epk(Range::full()),
                start: RequestStart::Beginning,
                max_item_count: 10,
            })
            .await;
        assert!(matches!(epk_full, Err(StoreError::Gone { .. })));
    }

    #[tokio::test]
    async fn test_merge_serves_epk_subrange() {
        let feed = InMemoryFeedContainer::new("rid", 2);
        let ranges = feed.read_partition_key_ranges().await.unwrap();
        feed.upsert_with_epk("10000000", json!({"id": "a"}));
        feed.upsert_with_epk("F0000000", json!({"id": "b"}));

        let merged = feed.merge(&ranges[0].id, &ranges[1].id).unwrap();
        let overlapping = feed.get_overlapping_ranges(&ranges[0].range).await.unwrap();
        assert_eq!(overlapping.len(), 1);
        assert_eq!(overlapping[0].id, merged);

        let page = feed
            .read_change_feed(&ChangeFeedRequest {
                feed_range: FeedRange::epk(ranges[0].range.clone()),
                start: RequestStart::Beginning,
                max_item_count: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.documents.len(), 1);
        assert_eq!(page.documents[0]["id"], "a");
    }

    #[tokio::test]
    async fn test_fault_injection_and_page_limit() {
        let feed = InMemoryFeedContainer::new("rid", 1);
        let request = ChangeFeedRequest {
            feed_range: FeedRange::PartitionKeyRange {
                id: "0".into(),
                range: Range::full(),
            },
            start: RequestStart::Beginning,
            max_item_count: 100,
        };
        feed.inject_fault(StoreError::Throttled {
            retry_after: Some(Duration::from_millis(5)),
        });
        assert!(matches!(
            feed.read_change_feed(&request).await,
            Err(StoreError::Throttled { .. })
        ));

        feed.set_page_size_limit(Some(10));
        assert!(matches!(
            feed.read_change_feed(&request).await,
            Err(StoreError::MaxItemCountTooLarge(100))
        ));
        assert_eq!(feed.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_request_log_is_bounded() {
        let feed = InMemoryFeedContainer::new("rid", 1);
        let total = REQUEST_LOG_CAPACITY + 100;
        for i in 0..total {
            let request = ChangeFeedRequest {
                feed_range: FeedRange::PartitionKeyRange {
                    id: "0".into(),
                    range: Range::full(),
                },
                start: RequestStart::Beginning,
                max_item_count: (i + 1) as u32,
            };
            feed.read_change_feed(&request).await.unwrap();
        }

        let requests = feed.requests();
        assert_eq!(requests.len(), REQUEST_LOG_CAPACITY);
        assert_eq!(requests[0].request.max_item_count, 101);
        assert_eq!(
            requests.last().unwrap().request.max_item_count,
            total as u32
        );
    }
}
