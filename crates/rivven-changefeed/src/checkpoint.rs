//! Checkpointing: persisting a partition's continuation into its lease.
//!
//! Processing is at-least-once. A batch is acknowledged by writing the
//! continuation that follows it; after a failover the new owner resumes from
//! the last acknowledged batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ChangeFeedError, Result};
use crate::lease::{Lease, LeaseManager};
use crate::observability::ChangeFeedMetrics;
use crate::observer::{ChangeFeedObserver, ChangeFeedObserverContext, CloseReason};

/// When progress gets checkpointed
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CheckpointFrequency {
    /// Observers checkpoint themselves through their context
    #[serde(default)]
    pub explicit_checkpoint: bool,

    /// Checkpoint once this many documents were processed
    #[serde(default)]
    pub processed_document_count: Option<u64>,

    /// Checkpoint once this much time has passed since the last one (milliseconds)
    #[serde(default)]
    pub time_interval_ms: Option<u64>,
}

impl CheckpointFrequency {
    /// Checkpoint after every batch
    pub fn every_batch() -> Self {
        Self::default()
    }

    /// Only checkpoint when the observer asks to
    pub fn explicit() -> Self {
        Self {
            explicit_checkpoint: true,
            ..Default::default()
        }
    }

    pub fn every(documents: u64) -> Self {
        Self {
            processed_document_count: Some(documents),
            ..Default::default()
        }
    }

    pub fn time_interval(&self) -> Option<Duration> {
        self.time_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.processed_document_count == Some(0) {
            return Err(ChangeFeedError::config(
                "checkpoint.processed_document_count must be positive",
            ));
        }
        if self.time_interval_ms == Some(0) {
            return Err(ChangeFeedError::config(
                "checkpoint.time_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// Writes a partition's continuation somewhere durable
#[async_trait]
pub trait PartitionCheckpointer: Send + Sync {
    async fn checkpoint_partition(&self, continuation: &str) -> Result<()>;
}

/// Checkpoints into the partition's lease
pub struct LeaseCheckpointer {
    lease_manager: Arc<LeaseManager>,
    lease: AsyncMutex<Lease>,
}

impl LeaseCheckpointer {
    pub fn new(lease_manager: Arc<LeaseManager>, lease: Lease) -> Self {
        Self {
            lease_manager,
            lease: AsyncMutex::new(lease),
        }
    }
}

#[async_trait]
impl PartitionCheckpointer for LeaseCheckpointer {
    async fn checkpoint_partition(&self, continuation: &str) -> Result<()> {
        let mut lease = self.lease.lock().await;
        *lease = self.lease_manager.checkpoint(&lease, continuation).await?;
        debug!(lease_token = %lease.lease_token, "Checkpoint written");
        ChangeFeedMetrics::increment_checkpoints();
        Ok(())
    }
}

struct Progress {
    processed_documents: u64,
    last_checkpoint: Instant,
}

/// Observer decorator that checkpoints on the configured frequency.
///
/// Failed checkpoints are logged and retried on a later batch; the
/// counters only reset when a checkpoint succeeds.
pub struct AutoCheckpointer<O> {
    frequency: CheckpointFrequency,
    inner: O,
    progress: Mutex<Progress>,
}

impl<O: ChangeFeedObserver> AutoCheckpointer<O> {
    pub fn new(frequency: CheckpointFrequency, inner: O) -> Self {
        Self {
            frequency,
            inner,
            progress: Mutex::new(Progress {
                processed_documents: 0,
                last_checkpoint: Instant::now(),
            }),
        }
    }

    fn is_checkpoint_needed(&self) -> bool {
        let progress = self.progress.lock();
        let count = self.frequency.processed_document_count;
        let interval = self.frequency.time_interval();
        if count.is_none() && interval.is_none() {
            return true;
        }
        if let Some(count) = count {
            if progress.processed_documents >= count {
                return true;
            }
        }
        if let Some(interval) = interval {
            if progress.last_checkpoint.elapsed() >= interval {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl<O: ChangeFeedObserver> ChangeFeedObserver for AutoCheckpointer<O> {
    async fn open(&self, ctx: &ChangeFeedObserverContext) -> anyhow::Result<()> {
        self.inner.open(ctx).await
    }

    async fn close(
        &self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> anyhow::Result<()> {
        self.inner.close(ctx, reason).await
    }

    async fn process_changes(
        &self,
        ctx: &ChangeFeedObserverContext,
        documents: Vec<Value>,
    ) -> anyhow::Result<()> {
        let count = documents.len() as u64;
        self.inner.process_changes(ctx, documents).await?;
        self.progress.lock().processed_documents += count;

        if self.is_checkpoint_needed() {
            match ctx.checkpoint_now().await {
                Ok(()) => {
                    let mut progress = self.progress.lock();
                    progress.processed_documents = 0;
                    progress.last_checkpoint = Instant::now();
                }
                Err(e) => {
                    ChangeFeedMetrics::increment_checkpoint_failures();
                    warn!(
                        lease_token = ctx.lease_token(),
                        error = %e,
                        "Checkpoint failed, will retry after the next batch"
                    );
                }
            }
        }
        Ok(())
    }
}
