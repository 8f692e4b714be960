//! End-to-end tests: several processors sharing in-memory containers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rivven_changefeed::store::memory::{InMemoryFeedContainer, InMemoryLeaseContainer};
use rivven_changefeed::{
    ChangeFeedObserver, ChangeFeedObserverContext, ChangeFeedProcessor,
    ChangeFeedProcessorOptions, StartFrom,
};

#[derive(Default)]
struct Collector {
    seen: Mutex<HashSet<u64>>,
}

#[async_trait]
impl ChangeFeedObserver for Collector {
    async fn process_changes(
        &self,
        _ctx: &ChangeFeedObserverContext,
        documents: Vec<Value>,
    ) -> anyhow::Result<()> {
        let mut seen = self.seen.lock();
        for doc in documents {
            if let Some(n) = doc["n"].as_u64() {
                seen.insert(n);
            }
        }
        Ok(())
    }
}

fn options() -> ChangeFeedProcessorOptions {
    ChangeFeedProcessorOptions {
        lease_renew_interval_ms: 1_000,
        lease_acquire_interval_ms: 2_000,
        // Longer than any test runs in wall-clock time, so leases only
        // change hands through release or stealing.
        lease_expiration_interval_ms: 600_000,
        feed_poll_delay_ms: 200,
        start_from: StartFrom::Beginning,
        bootstrap_retry_delay_ms: 500,
        ..Default::default()
    }
}

fn processor(
    host: &str,
    feed: &Arc<InMemoryFeedContainer>,
    leases: &Arc<InMemoryLeaseContainer>,
    collector: &Arc<Collector>,
) -> ChangeFeedProcessor {
    let collector = collector.clone();
    ChangeFeedProcessor::builder()
        .host_name(host)
        .options(options())
        .feed_container(feed.clone())
        .lease_container(leases.clone())
        .observer_factory(move || collector.clone() as Arc<dyn ChangeFeedObserver>)
        .build()
        .unwrap()
}

fn write_documents(feed: &InMemoryFeedContainer, range: std::ops::Range<u64>) {
    for n in range {
        feed.upsert(&format!("key-{n}"), json!({ "id": n.to_string(), "n": n }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_hosts_split_leases_evenly() {
    let feed = Arc::new(InMemoryFeedContainer::new("rid", 4));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    let collector = Arc::new(Collector::default());

    let a = processor("host-a", &feed, &leases, &collector);
    a.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.owned_lease_tokens().await.len(), 4);

    let b = processor("host-b", &feed, &leases, &collector);
    b.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let owned_a = a.owned_lease_tokens().await;
    let owned_b = b.owned_lease_tokens().await;
    assert_eq!(owned_a.len(), 2, "host-a owns {owned_a:?}");
    assert_eq!(owned_b.len(), 2, "host-b owns {owned_b:?}");
    let all: HashSet<_> = owned_a.iter().chain(owned_b.iter()).collect();
    assert_eq!(all.len(), 4);

    let state = a.current_state().await.unwrap();
    for lease in &state {
        let owner = lease.owner.as_deref().unwrap();
        let expected = if owned_a.contains(&lease.lease_token) {
            "host-a"
        } else {
            "host-b"
        };
        assert_eq!(owner, expected);
    }

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failover_resumes_from_checkpoint() {
    let feed = Arc::new(InMemoryFeedContainer::new("rid", 4));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    let collector = Arc::new(Collector::default());
    write_documents(&feed, 0..40);

    let a = processor("host-a", &feed, &leases, &collector);
    let b = processor("host-b", &feed, &leases, &collector);
    a.start().await.unwrap();
    b.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!a.owned_lease_tokens().await.is_empty());

    a.stop().await.unwrap();
    write_documents(&feed, 40..80);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(b.owned_lease_tokens().await, vec!["0", "1", "2", "3"]);
    let seen = collector.seen.lock().clone();
    assert_eq!(seen, (0..80).collect::<HashSet<_>>());

    let state = b.current_state().await.unwrap();
    assert!(state.iter().all(|l| l.owner.as_deref() == Some("host-b")));
    assert!(state.iter().all(|l| l.continuation_token.is_some()));

    b.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_split_hands_over_to_child_leases() {
    let feed = Arc::new(InMemoryFeedContainer::new("rid", 2));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    let collector = Arc::new(Collector::default());
    write_documents(&feed, 0..30);

    let host = processor("solo", &feed, &leases, &collector);
    host.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(host.owned_lease_tokens().await, vec!["0", "1"]);

    let (left, right) = feed.split("0").unwrap();
    assert_eq!((left.as_str(), right.as_str()), ("2", "3"));
    write_documents(&feed, 30..60);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(host.owned_lease_tokens().await, vec!["1", "2", "3"]);
    let tokens: Vec<String> = host
        .current_state()
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.lease_token)
        .collect();
    let tokens: HashSet<_> = tokens.into_iter().collect();
    assert_eq!(
        tokens,
        ["1", "2", "3"].into_iter().map(String::from).collect()
    );
    assert_eq!(
        collector.seen.lock().clone(),
        (0..60).collect::<HashSet<_>>()
    );

    host.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_processor_releases_everything() {
    let feed = Arc::new(InMemoryFeedContainer::new("rid", 3));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    let collector = Arc::new(Collector::default());

    let host = processor("solo", &feed, &leases, &collector);
    host.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    host.stop().await.unwrap();
    assert!(host.owned_lease_tokens().await.is_empty());

    let state = host.current_state().await.unwrap();
    assert_eq!(state.len(), 3);
    assert!(state.iter().all(|l| l.is_unowned()));

    // A restarted processor picks its leases back up.
    host.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(host.owned_lease_tokens().await, vec!["0", "1", "2"]);
    host.stop().await.unwrap();
}
