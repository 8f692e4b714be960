//! Reads one partition's change feed and hands pages to the observer.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sleep_or_cancel;
use crate::checkpoint::PartitionCheckpointer;
use crate::error::{ChangeFeedError, Result, StoreError};
use crate::feed::{ChangeFeedStartFrom, ChangeFeedState};
use crate::lease::Lease;
use crate::observability::ChangeFeedMetrics;
use crate::observer::{ChangeFeedObserver, ChangeFeedObserverContext, FeedResponseInfo};
use crate::store::{ChangeFeedPage, SharedMonitoredContainer};

/// How a processor reads its partition
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub start_state: ChangeFeedState,
    pub max_item_count: u32,
    pub feed_poll_delay: Duration,
    pub manual_checkpoint: bool,
}

/// Feed reader for a single lease
pub struct PartitionProcessor {
    lease: Lease,
    container: SharedMonitoredContainer,
    observer: Arc<dyn ChangeFeedObserver>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
    settings: ProcessorSettings,
}

impl PartitionProcessor {
    pub fn new(
        lease: Lease,
        container: SharedMonitoredContainer,
        observer: Arc<dyn ChangeFeedObserver>,
        checkpointer: Arc<dyn PartitionCheckpointer>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            lease,
            container,
            observer,
            checkpointer,
            settings,
        }
    }

    /// Read until cancelled or a terminal condition.
    ///
    /// Returns `Ok(())` on cancellation. Terminal conditions are
    /// `PartitionNotFound`, `PartitionSplit` (carrying the last continuation),
    /// observer failures and any unclassified store error.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let lease_token = self.lease.lease_token.clone();
        let mut state = self.settings.start_state.clone();
        let mut max_item_count = self.settings.max_item_count;
        info!(lease_token = %lease_token, "Partition processor started");

        while !token.is_cancelled() {
            let request = state.to_request(max_item_count);
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.container.read_change_feed(&request) => result,
            };

            match result {
                Ok(page) if page.is_empty() => {
                    ChangeFeedMetrics::increment_empty_polls();
                    if !state.has_continuation()
                        && matches!(state.start_from(), ChangeFeedStartFrom::Now)
                    {
                        // Pin "now" to the first answer so later pages do not skip changes.
                        state = state.with_continuation(page.continuation);
                    }
                    debug!(lease_token = %lease_token, "No changes, waiting for poll delay");
                    if !sleep_or_cancel(&token, self.settings.feed_poll_delay).await {
                        break;
                    }
                }
                Ok(page) => {
                    max_item_count = self.settings.max_item_count;
                    state = state.with_continuation(page.continuation.clone());
                    self.dispatch(&lease_token, &state, page).await?;
                }
                Err(StoreError::Throttled {
                    retry_after: Some(delay),
                }) => {
                    ChangeFeedMetrics::increment_throttled();
                    debug!(lease_token = %lease_token, ?delay, "Throttled, backing off");
                    if !sleep_or_cancel(&token, delay).await {
                        break;
                    }
                }
                Err(StoreError::MaxItemCountTooLarge(_)) => {
                    if max_item_count <= 1 {
                        return Err(ChangeFeedError::fatal(format!(
                            "partition {lease_token} cannot be read even one item at a time"
                        )));
                    }
                    max_item_count /= 2;
                    warn!(
                        lease_token = %lease_token,
                        max_item_count,
                        "Reducing page size"
                    );
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(ChangeFeedError::PartitionNotFound { lease_token });
                }
                Err(StoreError::Gone { reason }) => {
                    info!(lease_token = %lease_token, %reason, "Feed range gone");
                    let continuation = if state.has_continuation() {
                        Some(state.to_envelope()?)
                    } else {
                        self.lease.continuation_token.clone()
                    };
                    return Err(ChangeFeedError::PartitionSplit {
                        lease_token,
                        continuation,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(lease_token = %lease_token, "Partition processor stopped");
        Ok(())
    }

    async fn dispatch(
        &self,
        lease_token: &str,
        state: &ChangeFeedState,
        page: ChangeFeedPage,
    ) -> Result<()> {
        let item_count = page.documents.len();
        let response = FeedResponseInfo {
            continuation: page.continuation,
            request_charge: page.request_charge,
            session_token: page.session_token,
            activity_id: page.activity_id,
            item_count,
        };
        let ctx = ChangeFeedObserverContext::for_batch(
            lease_token,
            response,
            state.to_envelope()?,
            self.checkpointer.clone(),
            self.settings.manual_checkpoint,
        );
        debug!(lease_token, item_count, "Dispatching changes");
        self.observer
            .process_changes(&ctx, page.documents)
            .await
            .map_err(ChangeFeedError::Observer)?;
        ChangeFeedMetrics::record_batch(item_count);
        Ok(())
    }
}
