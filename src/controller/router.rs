//! Traffic router: the only writer of the routing object
//!
//! Two modes:
//! - Exclusive: 100% to one version. Instant blue-green cutover is just
//!   this one write; no instance is created, deleted or scaled.
//! - Weighted: a percentage split across two versions, used by canary.
//!
//! Every write carries the revision read just before it, so an
//! out-of-band edit between read and write surfaces as `RoutingConflict`
//! rather than being silently overwritten.
//!
//! Each read and write also updates a cached [`RoutingView`], kept fresh by
//! [`TrafficRouter::run`], so status reads never wait on the cluster.

use crate::cluster::{ClusterAdapter, ObservedRouting, RoutingState};
use crate::controller::registry::PodRegistry;
use crate::controller::ControllerError;
use crate::server::{SharedMetrics, ShutdownSignal};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Routing as last seen by the router
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingView {
    /// Last successful read or write; kept when a later read fails
    pub observed: Option<ObservedRouting>,
    /// Why the most recent read failed, cleared by the next success
    pub error: Option<String>,
}

pub struct TrafficRouter {
    cluster: Arc<dyn ClusterAdapter>,
    registry: Arc<PodRegistry>,
    versions: Vec<String>,
    metrics: Option<SharedMetrics>,
    view: watch::Sender<RoutingView>,
}

impl TrafficRouter {
    pub fn new(
        cluster: Arc<dyn ClusterAdapter>,
        registry: Arc<PodRegistry>,
        versions: Vec<String>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let (view, _) = watch::channel(RoutingView::default());
        Self {
            cluster,
            registry,
            versions,
            metrics,
            view,
        }
    }

    /// Read the routing object from the cluster and cache the result
    pub async fn current_routing(&self) -> Result<ObservedRouting, ControllerError> {
        match self.cluster.routing().await {
            Ok(observed) => {
                self.view.send_modify(|view| {
                    view.observed = Some(observed.clone());
                    view.error = None;
                });
                Ok(observed)
            }
            Err(e) => {
                self.view
                    .send_modify(|view| view.error = Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Cached routing from the last read or write. Never calls the cluster.
    pub fn routing_view(&self) -> RoutingView {
        self.view.borrow().clone()
    }

    /// Send all traffic to `version` in a single write
    ///
    /// Idempotent: when the route already points exclusively at `version`
    /// nothing is written.
    pub async fn switch_exclusive(&self, version: &str) -> Result<RoutingState, ControllerError> {
        if !self.versions.iter().any(|v| v == version) {
            return Err(ControllerError::InvalidRequest(format!(
                "unknown version {}",
                version
            )));
        }
        self.apply(RoutingState::exclusive(version)).await
    }

    /// Split traffic by percentage
    ///
    /// Rejected with `InvalidWeights` before any write when the weights do
    /// not sum to 100, name an unknown version, or give traffic to a
    /// version with no healthy instance in the registry. Zero-weight
    /// entries need no capacity.
    pub async fn set_weights(
        &self,
        weights: BTreeMap<String, u32>,
    ) -> Result<RoutingState, ControllerError> {
        if let Some(unknown) = weights.keys().find(|v| !self.versions.contains(v)) {
            return Err(ControllerError::InvalidWeights(format!(
                "unknown version {}",
                unknown
            )));
        }

        let snapshot = self.registry.snapshot().await;
        for (version, weight) in &weights {
            if *weight > 0 && snapshot.count(version).healthy == 0 {
                return Err(ControllerError::InvalidWeights(format!(
                    "version {} would receive {}% of traffic with no healthy instances",
                    version, weight
                )));
            }
        }

        let state = RoutingState::weighted(weights)?;
        self.apply(state).await
    }

    async fn apply(&self, desired: RoutingState) -> Result<RoutingState, ControllerError> {
        let observed = self.current_routing().await?;
        if observed.state == desired {
            debug!(routing = ?desired, "Routing already in desired state");
            return Ok(desired);
        }

        self.cluster
            .set_routing(&desired, observed.revision.as_deref())
            .await?;

        info!(from = ?observed.state, to = ?desired, "Traffic routing switched");
        // The new revision is unknown until the next read
        self.view.send_modify(|view| {
            view.observed = Some(ObservedRouting {
                state: desired.clone(),
                revision: None,
            });
            view.error = None;
        });
        if let Some(ref metrics) = self.metrics {
            metrics.set_traffic_weights(&self.versions, &desired);
        }
        Ok(desired)
    }

    /// Re-read the routing object every `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "Routing refresh loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.current_routing().await {
                        Ok(observed) => {
                            if let Some(ref metrics) = self.metrics {
                                metrics.set_traffic_weights(&self.versions, &observed.state);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Routing refresh failed, keeping last known routing");
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Routing refresh loop stopping");
                    break;
                }
            }
        }
    }
}
