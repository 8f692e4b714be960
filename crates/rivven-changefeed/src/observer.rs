//! Observer interface: the user code that consumes changes.
//!
//! One observer instance is created per partition. Calls for a partition
//! are strictly sequential: `open`, any number of `process_changes`, then
//! `close` with the reason the partition stopped.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::checkpoint::PartitionCheckpointer;
use crate::error::{ChangeFeedError, Result};

/// Why processing of a partition stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Unknown,
    /// The host is shutting down
    Shutdown,
    /// The partition no longer exists
    ResourceGone,
    /// Another host took the lease
    LeaseLost,
    /// The observer failed
    ObserverError,
    /// The partition was split or merged
    LeaseGone,
}

impl CloseReason {
    /// Classify how a partition ended
    pub fn classify(error: Option<&ChangeFeedError>, shutdown_requested: bool) -> Self {
        match error {
            Some(ChangeFeedError::LeaseLost { .. }) => CloseReason::LeaseLost,
            Some(ChangeFeedError::PartitionSplit { .. }) => CloseReason::LeaseGone,
            Some(ChangeFeedError::PartitionNotFound { .. }) => CloseReason::ResourceGone,
            Some(ChangeFeedError::Observer(_)) => CloseReason::ObserverError,
            Some(ChangeFeedError::Cancelled) => CloseReason::Shutdown,
            Some(_) => CloseReason::Unknown,
            None if shutdown_requested => CloseReason::Shutdown,
            None => CloseReason::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unknown => "unknown",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ResourceGone => "resource_gone",
            CloseReason::LeaseLost => "lease_lost",
            CloseReason::ObserverError => "observer_error",
            CloseReason::LeaseGone => "lease_gone",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata of the page being processed
#[derive(Debug, Clone, Default)]
pub struct FeedResponseInfo {
    pub continuation: String,
    pub request_charge: f64,
    pub session_token: Option<String>,
    pub activity_id: String,
    pub item_count: usize,
}

/// What an observer knows about the partition it is working on
#[derive(Clone)]
pub struct ChangeFeedObserverContext {
    lease_token: String,
    feed_response: Option<FeedResponseInfo>,
    continuation: Option<String>,
    checkpointer: Option<Arc<dyn PartitionCheckpointer>>,
    manual_checkpoint: bool,
}

impl fmt::Debug for ChangeFeedObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeedObserverContext")
            .field("lease_token", &self.lease_token)
            .field("feed_response", &self.feed_response)
            .field("manual_checkpoint", &self.manual_checkpoint)
            .finish()
    }
}

impl ChangeFeedObserverContext {
    /// Context for `open` and `close`
    pub fn for_partition(lease_token: impl Into<String>) -> Self {
        Self {
            lease_token: lease_token.into(),
            feed_response: None,
            continuation: None,
            checkpointer: None,
            manual_checkpoint: false,
        }
    }

    /// Context for one page of changes
    pub fn for_batch(
        lease_token: impl Into<String>,
        feed_response: FeedResponseInfo,
        continuation: String,
        checkpointer: Arc<dyn PartitionCheckpointer>,
        manual_checkpoint: bool,
    ) -> Self {
        Self {
            lease_token: lease_token.into(),
            feed_response: Some(feed_response),
            continuation: Some(continuation),
            checkpointer: Some(checkpointer),
            manual_checkpoint,
        }
    }

    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    pub fn feed_response(&self) -> Option<&FeedResponseInfo> {
        self.feed_response.as_ref()
    }

    /// Persist progress up to and including this batch.
    ///
    /// Only available when the processor is configured for explicit
    /// checkpointing.
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.manual_checkpoint {
            return Err(ChangeFeedError::invalid_operation(
                "checkpoint() requires explicit checkpointing to be enabled",
            ));
        }
        self.checkpoint_now().await
    }

    pub(crate) async fn checkpoint_now(&self) -> Result<()> {
        match (&self.checkpointer, &self.continuation) {
            (Some(checkpointer), Some(continuation)) => {
                checkpointer.checkpoint_partition(continuation).await
            }
            _ => Err(ChangeFeedError::invalid_operation(
                "no batch to checkpoint in this context",
            )),
        }
    }
}

/// Consumer of a partition's changes
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    async fn open(&self, _ctx: &ChangeFeedObserverContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(
        &self,
        _ctx: &ChangeFeedObserverContext,
        _reason: CloseReason,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_changes(
        &self,
        ctx: &ChangeFeedObserverContext,
        documents: Vec<Value>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: ChangeFeedObserver + ?Sized> ChangeFeedObserver for Arc<T> {
    async fn open(&self, ctx: &ChangeFeedObserverContext) -> anyhow::Result<()> {
        (**self).open(ctx).await
    }

    async fn close(
        &self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> anyhow::Result<()> {
        (**self).close(ctx, reason).await
    }

    async fn process_changes(
        &self,
        ctx: &ChangeFeedObserverContext,
        documents: Vec<Value>,
    ) -> anyhow::Result<()> {
        (**self).process_changes(ctx, documents).await
    }
}

/// Creates one observer per partition
pub trait ChangeFeedObserverFactory: Send + Sync {
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver>;
}

impl<F> ChangeFeedObserverFactory for F
where
    F: Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync,
{
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
        self()
    }
}

/// Shared observer factory handle
pub type SharedObserverFactory = Arc<dyn ChangeFeedObserverFactory>;

/// Marks every failure of the wrapped observer as an observer error,
/// panics included.
pub struct ObserverExceptionWrapper<O> {
    inner: O,
}

impl<O: ChangeFeedObserver> ObserverExceptionWrapper<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }

    async fn guard<F>(&self, operation: &str, lease_token: &str, fut: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(lease_token, operation, error = %e, "Observer failed");
                Err(e)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(lease_token, operation, panic = %message, "Observer panicked");
                Err(anyhow::anyhow!("observer panicked in {operation}: {message}"))
            }
        }
    }
}

#[async_trait]
impl<O: ChangeFeedObserver> ChangeFeedObserver for ObserverExceptionWrapper<O> {
    async fn open(&self, ctx: &ChangeFeedObserverContext) -> anyhow::Result<()> {
        self.guard("open", ctx.lease_token(), self.inner.open(ctx)).await
    }

    async fn close(
        &self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> anyhow::Result<()> {
        self.guard("close", ctx.lease_token(), self.inner.close(ctx, reason))
            .await
    }

    async fn process_changes(
        &self,
        ctx: &ChangeFeedObserverContext,
        documents: Vec<Value>,
    ) -> anyhow::Result<()> {
        self.guard(
            "process_changes",
            ctx.lease_token(),
            self.inner.process_changes(ctx, documents),
        )
        .await
    }
}
