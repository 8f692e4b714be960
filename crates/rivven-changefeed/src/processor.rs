//! Public entry point: a change feed processor for one host.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ChangeFeedProcessorOptions;
use crate::error::{ChangeFeedError, Result};
use crate::lease::{Lease, LeaseManager, LeaseStore};
use crate::observer::{ChangeFeedObserverFactory, SharedObserverFactory};
use crate::partition::{
    Bootstrapper, DefaultPartitionController, EqualPartitionsBalancingStrategy, HealthMonitor,
    HealthMonitoringController, PartitionController, PartitionLoadBalancer, PartitionManager,
    PartitionSupervisorFactory, PartitionSynchronizer, TracingHealthMonitor,
};
use crate::store::{SharedLeaseContainer, SharedMonitoredContainer};

struct RunningProcessor {
    manager: PartitionManager,
    controller: DefaultPartitionController,
}

/// Distributes a container's change feed across hosts sharing a lease
/// container.
///
/// Each host runs one processor with a unique host name. Processors
/// coordinate only through the lease container.
pub struct ChangeFeedProcessor {
    host_name: String,
    options: ChangeFeedProcessorOptions,
    feed_container: SharedMonitoredContainer,
    lease_container: SharedLeaseContainer,
    observer_factory: SharedObserverFactory,
    health_monitor: Arc<dyn HealthMonitor>,
    lease_manager: Arc<LeaseManager>,
    running: Mutex<Option<RunningProcessor>>,
}

impl ChangeFeedProcessor {
    pub fn builder() -> ChangeFeedProcessorBuilder {
        ChangeFeedProcessorBuilder::default()
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn options(&self) -> &ChangeFeedProcessorOptions {
        &self.options
    }

    /// Bootstrap leases, resume owned ones and start balancing.
    ///
    /// Bootstrap failures are returned here; partition failures never are.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ChangeFeedError::invalid_operation("processor is already running"));
        }

        let synchronizer = Arc::new(PartitionSynchronizer::new(
            self.feed_container.clone(),
            self.lease_manager.clone(),
        ));
        let bootstrapper = Bootstrapper::new(
            self.lease_container.clone(),
            Arc::new(LeaseStore::new(
                self.lease_container.clone(),
                self.options.lease_prefix.clone(),
            )),
            synchronizer.clone(),
            self.options.lease_expiration_interval(),
            self.options.bootstrap_retry_delay(),
        );
        let factory = PartitionSupervisorFactory::new(
            self.feed_container.clone(),
            self.lease_manager.clone(),
            self.observer_factory.clone(),
            self.options.clone(),
        );
        let controller =
            DefaultPartitionController::new(self.lease_manager.clone(), synchronizer, factory);
        let monitored: Arc<dyn PartitionController> = Arc::new(HealthMonitoringController::new(
            Arc::new(controller.clone()),
            self.health_monitor.clone(),
        ));
        let strategy = Arc::new(EqualPartitionsBalancingStrategy::new(
            self.host_name.clone(),
            self.options.min_scale_count,
            self.options.max_scale_count,
            self.options.lease_expiration_interval(),
        ));
        let load_balancer = PartitionLoadBalancer::new(
            monitored.clone(),
            self.lease_manager.clone(),
            strategy,
            self.options.lease_acquire_interval(),
        );
        let manager = PartitionManager::new(bootstrapper, monitored, load_balancer);

        manager.start().await?;
        info!(host = %self.host_name, "Change feed processor started");
        *running = Some(RunningProcessor {
            manager,
            controller,
        });
        Ok(())
    }

    /// Stop processing and release every lease this host holds
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.manager.stop().await?;
        info!(host = %self.host_name, "Change feed processor stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Lease tokens this host is currently processing
    pub async fn owned_lease_tokens(&self) -> Vec<String> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.controller.owned_lease_tokens(),
            None => Vec::new(),
        }
    }

    /// Every lease in the lease container, with owner and continuation
    pub async fn current_state(&self) -> Result<Vec<Lease>> {
        let mut leases = self.lease_manager.get_all_leases().await?;
        leases.sort_by(|a, b| a.range().min.cmp(&b.range().min));
        Ok(leases)
    }
}

/// Builder for [`ChangeFeedProcessor`]
#[derive(Default)]
pub struct ChangeFeedProcessorBuilder {
    host_name: Option<String>,
    options: ChangeFeedProcessorOptions,
    feed_container: Option<SharedMonitoredContainer>,
    lease_container: Option<SharedLeaseContainer>,
    observer_factory: Option<SharedObserverFactory>,
    health_monitor: Option<Arc<dyn HealthMonitor>>,
}

impl ChangeFeedProcessorBuilder {
    /// Lease owner name of this host (a random one is generated otherwise)
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn options(mut self, options: ChangeFeedProcessorOptions) -> Self {
        self.options = options;
        self
    }

    /// Container whose changes are processed
    pub fn feed_container(mut self, container: SharedMonitoredContainer) -> Self {
        self.feed_container = Some(container);
        self
    }

    /// Container holding the leases
    pub fn lease_container(mut self, container: SharedLeaseContainer) -> Self {
        self.lease_container = Some(container);
        self
    }

    pub fn observer_factory(mut self, factory: impl ChangeFeedObserverFactory + 'static) -> Self {
        self.observer_factory = Some(Arc::new(factory));
        self
    }

    pub fn health_monitor(mut self, monitor: Arc<dyn HealthMonitor>) -> Self {
        self.health_monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        self.options.validate()?;
        let feed_container = self
            .feed_container
            .ok_or_else(|| ChangeFeedError::config("feed container is required"))?;
        let lease_container = self
            .lease_container
            .ok_or_else(|| ChangeFeedError::config("lease container is required"))?;
        let observer_factory = self
            .observer_factory
            .ok_or_else(|| ChangeFeedError::config("observer factory is required"))?;
        let host_name = match self.host_name {
            Some(name) if name.trim().is_empty() => {
                return Err(ChangeFeedError::config("host name must not be empty"))
            }
            Some(name) => name,
            None => format!("host-{}", uuid::Uuid::new_v4()),
        };

        let lease_manager = Arc::new(LeaseManager::new(
            lease_container.clone(),
            self.options.lease_prefix.clone(),
            host_name.clone(),
        ));
        Ok(ChangeFeedProcessor {
            host_name,
            options: self.options,
            feed_container,
            lease_container,
            observer_factory,
            health_monitor: self
                .health_monitor
                .unwrap_or_else(|| Arc::new(TracingHealthMonitor)),
            lease_manager,
            running: Mutex::new(None),
        })
    }
}
