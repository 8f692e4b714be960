//! rivven-changefeed - Lease-coordinated change feed processing
//!
//! Spreads the change feed of a partitioned document container across any
//! number of hosts. Hosts never talk to each other: every partition has a
//! lease document in a shared lease container, and ownership moves between
//! hosts through conditional writes on those documents.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       ChangeFeedProcessor                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  PartitionManager                                                │
//! │   ├── Bootstrapper ─────────── LeaseStore (.info / .lock)        │
//! │   ├── PartitionLoadBalancer ── EqualPartitionsBalancingStrategy  │
//! │   └── PartitionController (health-monitored)                     │
//! │         └── PartitionSupervisor per lease                        │
//! │               ├── PartitionProcessor ─► observer chain           │
//! │               └── LeaseRenewer                                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  LeaseManager / LeaseUpdater  (optimistic concurrency, etags)    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  LeaseContainer            │  MonitoredContainer                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use rivven_changefeed::{ChangeFeedObserver, ChangeFeedObserverContext, ChangeFeedProcessor};
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl ChangeFeedObserver for Printer {
//!     async fn process_changes(
//!         &self,
//!         ctx: &ChangeFeedObserverContext,
//!         documents: Vec<serde_json::Value>,
//!     ) -> anyhow::Result<()> {
//!         println!("{}: {} changes", ctx.lease_token(), documents.len());
//!         Ok(())
//!     }
//! }
//!
//! let processor = ChangeFeedProcessor::builder()
//!     .host_name("host-1")
//!     .feed_container(feed)
//!     .lease_container(leases)
//!     .observer_factory(|| Arc::new(Printer) as Arc<dyn ChangeFeedObserver>)
//!     .build()?;
//! processor.start().await?;
//! ```
//!
//! Processing is at-least-once: after a failover the new owner resumes from
//! the last checkpoint, so observers must tolerate replays.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod feed;
pub mod lease;
pub mod observability;
pub mod observer;
pub mod partition;
pub mod processor;
pub mod store;

pub use checkpoint::{AutoCheckpointer, CheckpointFrequency, PartitionCheckpointer};
pub use config::{ChangeFeedConfig, ChangeFeedProcessorOptions, StartFrom};
pub use error::{ChangeFeedError, GoneReason, Result, StoreError, StoreResult};
pub use feed::{ChangeFeedStartFrom, ChangeFeedState, FeedRange, PartitionKeyRange, Range};
pub use lease::{Lease, LeaseManager, LeaseStore};
pub use observability::ChangeFeedMetrics;
pub use observer::{
    ChangeFeedObserver, ChangeFeedObserverContext, ChangeFeedObserverFactory, CloseReason,
    FeedResponseInfo,
};
pub use partition::{HealthMonitor, HealthMonitoringRecord, HealthSeverity, TracingHealthMonitor};
pub use processor::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
pub use store::{LeaseContainer, MonitoredContainer};
