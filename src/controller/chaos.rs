//! Chaos injector: terminate one named instance
//!
//! Only the deletion request is issued here. Replacement is the cluster's
//! own replica-count enforcement, and shows up in the pod registry on a
//! later refresh.

use crate::cluster::ClusterAdapter;
use crate::server::SharedMetrics;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ChaosInjector {
    cluster: Arc<dyn ClusterAdapter>,
    metrics: Option<SharedMetrics>,
}

impl ChaosInjector {
    pub fn new(cluster: Arc<dyn ClusterAdapter>, metrics: Option<SharedMetrics>) -> Self {
        Self { cluster, metrics }
    }

    /// Fire-and-forget deletion of `instance`
    ///
    /// Failures are logged and counted, never returned: a missing instance
    /// is an acceptable outcome.
    pub async fn kill(&self, instance: &str) {
        let outcome = match self.cluster.delete_instance(instance).await {
            Ok(()) => {
                info!(instance, "Chaos: instance termination requested");
                "requested"
            }
            Err(e) => {
                warn!(instance, error = %e, "Chaos: instance termination failed");
                "failed"
            }
        };
        if let Some(ref metrics) = self.metrics {
            metrics.record_kill(outcome);
        }
    }
}
