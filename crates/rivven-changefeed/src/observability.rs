//! Metrics for lease coordination and feed processing
//!
//! Uses the `metrics` crate facade; install any exporter in the host
//! application. With the `metrics` feature disabled every call compiles to
//! nothing.
//!
//! All metrics follow the pattern `rivven_changefeed_{name}_{unit}`.

// ============================================================================
// Change feed metrics
// ============================================================================

/// Change feed processor metrics
pub struct ChangeFeedMetrics;

impl ChangeFeedMetrics {
    // ---- Leases ----

    pub fn increment_leases_acquired() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_leases_acquired_total").increment(1);
    }

    pub fn increment_leases_released() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_leases_released_total").increment(1);
    }

    pub fn increment_leases_lost() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_leases_lost_total").increment(1);
    }

    /// Splits and merges handled
    pub fn increment_feed_ranges_gone() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_feed_ranges_gone_total").increment(1);
    }

    pub fn set_owned_partitions(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("rivven_changefeed_owned_partitions").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    // ---- Processing ----

    pub fn record_batch(documents: usize) {
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("rivven_changefeed_batches_total").increment(1);
            metrics::counter!("rivven_changefeed_documents_total").increment(documents as u64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = documents;
    }

    pub fn increment_empty_polls() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_empty_polls_total").increment(1);
    }

    pub fn increment_throttled() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_throttled_total").increment(1);
    }

    pub fn increment_checkpoints() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_checkpoints_total").increment(1);
    }

    pub fn increment_checkpoint_failures() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_checkpoint_failures_total").increment(1);
    }

    // ---- Health ----

    pub fn increment_health_errors() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_health_errors_total").increment(1);
    }

    /// Partitions that stopped, labelled by close reason
    pub fn increment_partitions_closed(reason: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_changefeed_partitions_closed_total", "reason" => reason)
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        ChangeFeedMetrics::increment_leases_acquired();
        ChangeFeedMetrics::record_batch(10);
        ChangeFeedMetrics::set_owned_partitions(3);
        ChangeFeedMetrics::increment_partitions_closed("shutdown");
    }
}
