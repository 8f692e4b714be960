//! Runs one owned partition: processor and renewer side by side.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{LeaseRenewer, PartitionProcessor, ProcessorSettings};
use crate::checkpoint::{AutoCheckpointer, LeaseCheckpointer};
use crate::config::ChangeFeedProcessorOptions;
use crate::error::{ChangeFeedError, Result};
use crate::feed::{ChangeFeedStartFrom, ChangeFeedState};
use crate::lease::{Lease, LeaseManager};
use crate::observability::ChangeFeedMetrics;
use crate::observer::{
    ChangeFeedObserver, ChangeFeedObserverContext, CloseReason, ObserverExceptionWrapper,
    SharedObserverFactory,
};
use crate::store::SharedMonitoredContainer;

/// Lifecycle owner of one partition.
///
/// ```text
/// shutdown token ──► partition token (child)
///                      ├──► PartitionProcessor
///                      └──► LeaseRenewer
/// ```
///
/// Whichever task finishes first cancels the partition token; the observer
/// is closed with the classified reason.
pub struct PartitionSupervisor {
    lease: Lease,
    observer: Arc<dyn ChangeFeedObserver>,
    processor: PartitionProcessor,
    renewer: LeaseRenewer,
}

impl PartitionSupervisor {
    pub fn new(
        lease: Lease,
        observer: Arc<dyn ChangeFeedObserver>,
        processor: PartitionProcessor,
        renewer: LeaseRenewer,
    ) -> Self {
        Self {
            lease,
            observer,
            processor,
            renewer,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Run until shutdown or a terminal partition condition.
    ///
    /// Returns the terminal error, if any. Processor errors take precedence
    /// over renewer errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            lease,
            observer,
            processor,
            renewer,
        } = self;
        let ctx = ChangeFeedObserverContext::for_partition(&lease.lease_token);

        if let Err(e) = observer.open(&ctx).await {
            let error = ChangeFeedError::Observer(e);
            close(observer.as_ref(), &ctx, Some(&error), shutdown.is_cancelled()).await;
            return Err(error);
        }

        let partition_token = shutdown.child_token();
        let mut processor_task = tokio::spawn(processor.run(partition_token.clone()));
        let mut renewer_task = tokio::spawn(renewer.run(partition_token.clone()));

        let mut processor_result = None;
        let mut renewer_result = None;
        tokio::select! {
            result = &mut processor_task => processor_result = Some(flatten(result)),
            result = &mut renewer_task => renewer_result = Some(flatten(result)),
            _ = shutdown.cancelled() => {}
        }
        partition_token.cancel();

        let processor_result = match processor_result {
            Some(r) => r,
            None => flatten(processor_task.await),
        };
        let renewer_result = match renewer_result {
            Some(r) => r,
            None => flatten(renewer_task.await),
        };

        let error = processor_result.err().or(renewer_result.err());
        close(observer.as_ref(), &ctx, error.as_ref(), shutdown.is_cancelled()).await;
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn close(
    observer: &dyn ChangeFeedObserver,
    ctx: &ChangeFeedObserverContext,
    error: Option<&ChangeFeedError>,
    shutdown_requested: bool,
) {
    let reason = CloseReason::classify(error, shutdown_requested);
    info!(lease_token = ctx.lease_token(), %reason, "Closing partition");
    ChangeFeedMetrics::increment_partitions_closed(reason.as_str());
    if let Err(e) = observer.close(ctx, reason).await {
        warn!(lease_token = ctx.lease_token(), error = %e, "Observer close failed");
    }
}

fn flatten(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(ChangeFeedError::Cancelled),
        Err(e) => Err(ChangeFeedError::fatal(format!("partition task panicked: {e}"))),
    }
}

/// Builds supervisors for acquired leases
pub struct PartitionSupervisorFactory {
    container: SharedMonitoredContainer,
    lease_manager: Arc<LeaseManager>,
    observer_factory: SharedObserverFactory,
    options: ChangeFeedProcessorOptions,
    container_rid: OnceCell<String>,
}

impl PartitionSupervisorFactory {
    pub fn new(
        container: SharedMonitoredContainer,
        lease_manager: Arc<LeaseManager>,
        observer_factory: SharedObserverFactory,
        options: ChangeFeedProcessorOptions,
    ) -> Self {
        Self {
            container,
            lease_manager,
            observer_factory,
            options,
            container_rid: OnceCell::new(),
        }
    }

    pub async fn create(&self, lease: Lease) -> Result<PartitionSupervisor> {
        let rid = self
            .container_rid
            .get_or_try_init(|| async { self.container.container_rid().await })
            .await?;
        let default_start = ChangeFeedStartFrom::from(&self.options.start_from);
        let start_state = ChangeFeedState::for_lease(
            rid,
            &lease.feed_range,
            lease.continuation_token.as_deref(),
            &default_start,
        )?;

        let user_observer = ObserverExceptionWrapper::new(self.observer_factory.create_observer());
        let frequency = self.options.checkpoint.clone();
        let manual_checkpoint = frequency.explicit_checkpoint;
        let observer: Arc<dyn ChangeFeedObserver> = if manual_checkpoint {
            Arc::new(user_observer)
        } else {
            Arc::new(AutoCheckpointer::new(frequency, user_observer))
        };

        let checkpointer = Arc::new(LeaseCheckpointer::new(
            self.lease_manager.clone(),
            lease.clone(),
        ));
        let processor = PartitionProcessor::new(
            lease.clone(),
            self.container.clone(),
            observer.clone(),
            checkpointer,
            ProcessorSettings {
                start_state,
                max_item_count: self.options.max_items_per_page,
                feed_poll_delay: self.options.feed_poll_delay(),
                manual_checkpoint,
            },
        );
        let renewer = LeaseRenewer::new(
            self.lease_manager.clone(),
            lease.clone(),
            self.options.lease_renew_interval(),
        );
        Ok(PartitionSupervisor::new(lease, observer, processor, renewer))
    }
}
