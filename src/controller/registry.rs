//! Pod registry: a periodically refreshed snapshot of every instance
//!
//! Reads never touch the cluster. Each refresh replaces the snapshot
//! wholesale, so readers see either the previous or the next snapshot and
//! never a mix. Between refreshes the data is stale by up to one refresh
//! interval; callers accept that bound.

use crate::cluster::{ClusterAdapter, ClusterError, Health, Instance};
use crate::controller::clock::Clock;
use crate::server::{ReadinessState, SharedMetrics, ShutdownSignal};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Instance totals for one version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionCount {
    pub total: usize,
    pub healthy: usize,
}

/// Point-in-time view of all instances
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub instances: Vec<Instance>,
    /// None until the first successful refresh
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn count(&self, version: &str) -> VersionCount {
        self.instances
            .iter()
            .filter(|i| i.version == version)
            .fold(VersionCount::default(), |mut acc, i| {
                acc.total += 1;
                if i.health == Health::Healthy {
                    acc.healthy += 1;
                }
                acc
            })
    }

    pub fn counts(&self) -> BTreeMap<String, VersionCount> {
        let mut counts: BTreeMap<String, VersionCount> = BTreeMap::new();
        for instance in &self.instances {
            let entry = counts.entry(instance.version.clone()).or_default();
            entry.total += 1;
            if instance.health == Health::Healthy {
                entry.healthy += 1;
            }
        }
        counts
    }
}

pub struct PodRegistry {
    cluster: Arc<dyn ClusterAdapter>,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    metrics: Option<SharedMetrics>,
}

impl PodRegistry {
    pub fn new(
        cluster: Arc<dyn ClusterAdapter>,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            cluster,
            clock,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            metrics,
        }
    }

    /// Rebuild the snapshot from a full instance listing
    ///
    /// On failure the previous snapshot is kept.
    pub async fn refresh(&self) -> Result<usize, ClusterError> {
        let instances = match self.cluster.list_instances(None).await {
            Ok(instances) => instances,
            Err(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_registry_refresh(false);
                }
                return Err(e);
            }
        };

        let next = RegistrySnapshot {
            instances,
            refreshed_at: Some(self.clock.now()),
        };
        let count = next.instances.len();
        if let Some(ref metrics) = self.metrics {
            metrics.record_registry_refresh(true);
            metrics.set_instance_counts(&next.instances);
        }

        *self.snapshot.write().await = Arc::new(next);
        debug!(instances = count, "Pod registry refreshed");
        Ok(count)
    }

    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn instances(&self) -> Vec<Instance> {
        self.snapshot().await.instances.clone()
    }

    /// (total, healthy) for one version from the last snapshot
    pub async fn count_by_version(&self, version: &str) -> VersionCount {
        self.snapshot().await.count(version)
    }

    /// Refresh on a fixed interval until shutdown
    ///
    /// Marks `readiness` ready after the first successful refresh. Refresh
    /// failures are logged and the stale snapshot is kept.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        readiness: ReadinessState,
        mut shutdown: ShutdownSignal,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "Pod registry refresh loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(_) => {
                            if !readiness.is_ready() {
                                info!("First registry snapshot loaded, controller ready");
                                readiness.set_ready();
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Pod registry refresh failed, keeping stale snapshot");
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Pod registry refresh loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
