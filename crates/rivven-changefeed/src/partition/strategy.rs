//! Deciding which leases this host should try to take.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::lease::Lease;

/// Picks acquisition candidates from the full lease list
pub trait LoadBalancingStrategy: Send + Sync {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease>;
}

/// Converges every host towards `ceil(leases / hosts)` leases.
///
/// Each cycle a host either takes expired leases up to its deficit or, when
/// none are free, steals a single lease from the most loaded host. Hosts
/// are only known through the owners written on leases.
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_partition_count: usize,
    max_partition_count: usize,
    lease_expiration_interval: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(
        host_name: impl Into<String>,
        min_partition_count: usize,
        max_partition_count: usize,
        lease_expiration_interval: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            min_partition_count,
            max_partition_count,
            lease_expiration_interval,
        }
    }

    fn target_partition_count(&self, partition_count: usize, worker_count: usize) -> usize {
        let mut target = partition_count.div_ceil(worker_count.max(1));
        if self.max_partition_count > 0 {
            target = target.min(self.max_partition_count);
        }
        if self.min_partition_count > 0 {
            target = target.max(self.min_partition_count);
        }
        target
    }

    pub(crate) fn select_at(&self, all_leases: &[Lease], now: DateTime<Utc>) -> Vec<Lease> {
        if all_leases.is_empty() {
            return Vec::new();
        }

        let me = self.host_name.to_lowercase();
        let mut worker_counts: HashMap<String, usize> = HashMap::new();
        worker_counts.insert(me.clone(), 0);
        let mut expired = Vec::new();
        for lease in all_leases {
            if lease.is_expired(now, self.lease_expiration_interval) {
                expired.push(lease.clone());
            } else if let Some(owner) = lease.owner.as_deref() {
                *worker_counts.entry(owner.to_lowercase()).or_insert(0) += 1;
            }
        }

        let target = self.target_partition_count(all_leases.len(), worker_counts.len());
        let mine = worker_counts.get(&me).copied().unwrap_or(0);
        let needed = target.saturating_sub(mine);
        debug!(
            host = %self.host_name,
            leases = all_leases.len(),
            hosts = worker_counts.len(),
            target,
            owned = mine,
            expired = expired.len(),
            "Balancing"
        );
        if needed == 0 {
            return Vec::new();
        }

        if !expired.is_empty() {
            expired.shuffle(&mut rand::thread_rng());
            expired.truncate(needed);
            return expired;
        }

        self.lease_to_steal(all_leases, &worker_counts, target, needed)
            .into_iter()
            .collect()
    }

    fn lease_to_steal(
        &self,
        all_leases: &[Lease],
        worker_counts: &HashMap<String, usize>,
        target: usize,
        needed: usize,
    ) -> Option<Lease> {
        let (victim, count) = worker_counts.iter().max_by_key(|(_, count)| **count)?;
        let threshold = if needed > 1 { target.saturating_sub(1) } else { target };
        if *count <= threshold {
            return None;
        }
        all_leases
            .iter()
            .find(|lease| lease.is_owned_by(victim))
            .cloned()
    }
}

impl LoadBalancingStrategy for EqualPartitionsBalancingStrategy {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
        self.select_at(all_leases, Utc::now())
    }
}
