//! Tracks the partitions this host is processing.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PartitionSupervisorFactory, PartitionSynchronizer};
use crate::error::{ChangeFeedError, Result};
use crate::lease::{Lease, LeaseManager};
use crate::observability::ChangeFeedMetrics;

/// Starts and stops partition processing as leases come and go
#[async_trait]
pub trait PartitionController: Send + Sync {
    /// Resume the leases this host already owns
    async fn initialize(&self) -> Result<()>;

    /// Take a lease and start processing it, or refresh a running one
    async fn add_or_update_lease(&self, lease: Lease) -> Result<()>;

    /// Stop every partition and release its lease
    async fn shutdown(&self) -> Result<()>;
}

struct WorkerHandle {
    id: u64,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

struct ControllerInner {
    lease_manager: Arc<LeaseManager>,
    synchronizer: Arc<PartitionSynchronizer>,
    factory: PartitionSupervisorFactory,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    next_worker_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Runs one supervisor task per owned lease.
///
/// A slot is reserved in the worker map before the lease is acquired, so
/// concurrent calls for the same lease token never start two supervisors.
#[derive(Clone)]
pub struct DefaultPartitionController {
    inner: Arc<ControllerInner>,
}

impl DefaultPartitionController {
    pub fn new(
        lease_manager: Arc<LeaseManager>,
        synchronizer: Arc<PartitionSynchronizer>,
        factory: PartitionSupervisorFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                lease_manager,
                synchronizer,
                factory,
                workers: Mutex::new(HashMap::new()),
                next_worker_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Lease tokens with a running or starting supervisor
    pub fn owned_lease_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.inner.workers.lock().keys().cloned().collect();
        tokens.sort();
        tokens
    }

    fn remove_worker(&self, lease_token: &str, id: u64) {
        let mut workers = self.inner.workers.lock();
        if workers.get(lease_token).map(|w| w.id) == Some(id) {
            workers.remove(lease_token);
        }
        ChangeFeedMetrics::set_owned_partitions(workers.len());
    }

    async fn run_worker(self, id: u64, lease: Lease, cancel: CancellationToken) {
        let lease_token = lease.lease_token.clone();
        let result = match self.inner.factory.create(lease.clone()).await {
            Ok(supervisor) => supervisor.run(cancel).await,
            Err(e) => Err(e),
        };
        self.remove_worker(&lease_token, id);

        match result {
            Err(ChangeFeedError::PartitionSplit { continuation, .. })
                if !self.inner.shutdown.is_cancelled() =>
            {
                let mut lease = lease;
                if continuation.is_some() {
                    lease.continuation_token = continuation;
                }
                self.handle_feed_range_gone(lease).await;
            }
            result => {
                match &result {
                    Ok(()) => debug!(lease_token = %lease_token, "Partition stopped"),
                    Err(e) if e.is_lease_lost() => {
                        info!(lease_token = %lease_token, "Partition stopped, lease lost")
                    }
                    Err(e) => error!(lease_token = %lease_token, error = %e, "Partition failed"),
                }
                self.release(&lease).await;
            }
        }
    }

    async fn release(&self, lease: &Lease) {
        match self.inner.lease_manager.release(lease).await {
            Ok(()) => {
                ChangeFeedMetrics::increment_leases_released();
                info!(lease_token = %lease.lease_token, "Lease released");
            }
            Err(e) if e.is_lease_lost() => {
                debug!(lease_token = %lease.lease_token, "Lease already taken, nothing to release");
            }
            Err(e) => {
                warn!(lease_token = %lease.lease_token, error = %e, "Failed to release lease");
            }
        }
    }

    async fn handle_feed_range_gone(&self, lease: Lease) {
        if let Err(e) = self.try_handle_feed_range_gone(&lease).await {
            error!(
                lease_token = %lease.lease_token,
                error = %e,
                "Failed to hand over gone feed range"
            );
            self.release(&lease).await;
        }
    }

    async fn try_handle_feed_range_gone(&self, lease: &Lease) -> Result<()> {
        let handler = self
            .inner
            .synchronizer
            .get_feed_range_gone_handler(lease)
            .await?;
        let mut successors = handler.handle(&self.inner.lease_manager).await?;
        if handler.should_delete_current_lease() {
            for successor in &mut successors {
                successor.properties = lease.properties.clone();
            }
        }

        let results = join_all(
            successors
                .into_iter()
                .map(|successor| self.add_or_update_lease(successor)),
        )
        .await;
        for result in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_lease_lost() => {
                    debug!(
                        lease_token = %lease.lease_token,
                        "Successor lease taken by another host"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if handler.should_delete_current_lease() {
            self.inner.lease_manager.delete(lease).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionController for DefaultPartitionController {
    async fn initialize(&self) -> Result<()> {
        let owned = self.inner.lease_manager.get_owned_leases().await?;
        info!(
            host = self.inner.lease_manager.host_name(),
            count = owned.len(),
            "Resuming owned leases"
        );
        let results =
            join_all(owned.into_iter().map(|lease| self.add_or_update_lease(lease))).await;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Failed to resume owned lease");
            }
        }
        Ok(())
    }

    async fn add_or_update_lease(&self, lease: Lease) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ChangeFeedError::Cancelled);
        }

        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let already_running = {
            let mut workers = self.inner.workers.lock();
            if workers.contains_key(&lease.lease_token) {
                true
            } else {
                workers.insert(
                    lease.lease_token.clone(),
                    WorkerHandle {
                        id,
                        cancel: cancel.clone(),
                        join: None,
                    },
                );
                false
            }
        };

        if already_running {
            self.inner.lease_manager.update_properties(&lease).await?;
            debug!(lease_token = %lease.lease_token, "Updated properties of running lease");
            return Ok(());
        }

        let acquired = match self.inner.lease_manager.acquire(&lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.remove_worker(&lease.lease_token, id);
                return Err(e);
            }
        };
        ChangeFeedMetrics::increment_leases_acquired();
        info!(
            lease_token = %acquired.lease_token,
            host = self.inner.lease_manager.host_name(),
            "Lease acquired"
        );

        // Checked under the worker lock: shutdown cancels before it collects
        // join handles, so either it sees this worker or we see the cancel.
        {
            let mut workers = self.inner.workers.lock();
            if !self.inner.shutdown.is_cancelled() {
                let join = tokio::spawn(self.clone().run_worker(id, acquired, cancel));
                if let Some(worker) = workers.get_mut(&lease.lease_token) {
                    if worker.id == id {
                        worker.join = Some(join);
                    }
                }
                ChangeFeedMetrics::set_owned_partitions(workers.len());
                return Ok(());
            }
        }

        info!(lease_token = %acquired.lease_token, "Shutdown started during acquire");
        self.remove_worker(&lease.lease_token, id);
        self.release(&acquired).await;
        Err(ChangeFeedError::Cancelled)
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock();
            workers
                .values_mut()
                .filter_map(|w| {
                    w.cancel.cancel();
                    w.join.take()
                })
                .collect()
        };
        info!(partitions = handles.len(), "Stopping partitions");
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Partition task ended abnormally");
            }
        }
        ChangeFeedMetrics::set_owned_partitions(0);
        Ok(())
    }
}
