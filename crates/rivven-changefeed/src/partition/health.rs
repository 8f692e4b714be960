//! Health reporting for lease acquisition.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::PartitionController;
use crate::error::{ChangeFeedError, Result};
use crate::lease::Lease;
use crate::observability::ChangeFeedMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSeverity {
    Informational,
    Error,
    Critical,
}

/// What the host was doing when the record was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredOperation {
    AcquireLease,
}

impl fmt::Display for MonitoredOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoredOperation::AcquireLease => write!(f, "acquire_lease"),
        }
    }
}

#[derive(Debug)]
pub struct HealthMonitoringRecord {
    pub severity: HealthSeverity,
    pub operation: MonitoredOperation,
    pub lease: Lease,
    pub error: Option<ChangeFeedError>,
}

/// Receives health records
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn inspect(&self, record: HealthMonitoringRecord);
}

/// Writes health records to the tracing log
#[derive(Debug, Default, Clone)]
pub struct TracingHealthMonitor;

#[async_trait]
impl HealthMonitor for TracingHealthMonitor {
    async fn inspect(&self, record: HealthMonitoringRecord) {
        let lease_token = record.lease.lease_token.as_str();
        let operation = record.operation;
        match (record.severity, &record.error) {
            (HealthSeverity::Informational, _) => {
                debug!(lease_token, %operation, "Health check passed")
            }
            (HealthSeverity::Error, Some(e)) => {
                warn!(lease_token, %operation, error = %e, "Health check failed")
            }
            (HealthSeverity::Critical, Some(e)) => {
                error!(lease_token, %operation, error = %e, "Critical health failure")
            }
            (severity, None) => info!(lease_token, %operation, ?severity, "Health record"),
        }
    }
}

/// Controller decorator that reports acquisition outcomes.
///
/// Failures to add a lease are never returned to the load balancer; the
/// lease is simply retried on a later cycle. Store errors and lost races are
/// expected under contention and are not reported as unhealthy.
pub struct HealthMonitoringController {
    inner: Arc<dyn PartitionController>,
    monitor: Arc<dyn HealthMonitor>,
}

impl HealthMonitoringController {
    pub fn new(inner: Arc<dyn PartitionController>, monitor: Arc<dyn HealthMonitor>) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl PartitionController for HealthMonitoringController {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn add_or_update_lease(&self, lease: Lease) -> Result<()> {
        match self.inner.add_or_update_lease(lease.clone()).await {
            Ok(()) => {
                self.monitor
                    .inspect(HealthMonitoringRecord {
                        severity: HealthSeverity::Informational,
                        operation: MonitoredOperation::AcquireLease,
                        lease,
                        error: None,
                    })
                    .await;
            }
            Err(e) if e.is_lease_lost() || e.is_store_error() => {
                debug!(lease_token = %lease.lease_token, error = %e, "Lease not taken");
            }
            Err(e) => {
                ChangeFeedMetrics::increment_health_errors();
                self.monitor
                    .inspect(HealthMonitoringRecord {
                        severity: HealthSeverity::Error,
                        operation: MonitoredOperation::AcquireLease,
                        lease,
                        error: Some(e),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::feed::{FeedRange, PartitionKeyRange, Range};
    use parking_lot::Mutex;

    struct Scripted {
        next: Mutex<Vec<Result<()>>>,
    }

    #[async_trait]
    impl PartitionController for Scripted {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn add_or_update_lease(&self, _lease: Lease) -> Result<()> {
            self.next.lock().remove(0)
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        records: Mutex<Vec<(HealthSeverity, bool)>>,
    }

    #[async_trait]
    impl HealthMonitor for Recording {
        async fn inspect(&self, record: HealthMonitoringRecord) {
            self.records
                .lock()
                .push((record.severity, record.error.is_some()));
        }
    }

    fn lease() -> Lease {
        Lease::new(
            "cf",
            FeedRange::partition_key_range(&PartitionKeyRange::new("0", Range::full())),
            None,
        )
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_classified() {
        let inner = Arc::new(Scripted {
            next: Mutex::new(vec![
                Ok(()),
                Err(ChangeFeedError::lease_lost("0", Some("host-b".into()))),
                Err(StoreError::Unavailable("down".into()).into()),
                Err(ChangeFeedError::fatal("broken")),
            ]),
        });
        let monitor = Arc::new(Recording::default());
        let controller = HealthMonitoringController::new(inner, monitor.clone());

        for _ in 0..4 {
            controller.add_or_update_lease(lease()).await.unwrap();
        }
        assert_eq!(
            *monitor.records.lock(),
            vec![
                (HealthSeverity::Informational, false),
                (HealthSeverity::Error, true)
            ]
        );
    }

    #[tokio::test]
    async fn test_tracing_monitor_accepts_every_severity() {
        let monitor = TracingHealthMonitor;
        for severity in [
            HealthSeverity::Informational,
            HealthSeverity::Error,
            HealthSeverity::Critical,
        ] {
            monitor
                .inspect(HealthMonitoringRecord {
                    severity,
                    operation: MonitoredOperation::AcquireLease,
                    lease: lease(),
                    error: Some(ChangeFeedError::fatal("x")),
                })
                .await;
        }
    }
}
