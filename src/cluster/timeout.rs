//! Bounded cluster calls
//!
//! Wraps any adapter so that every call gives up after a fixed timeout.
//! An elapsed call is reported as `ClusterUnreachable`, which callers
//! already treat as retryable.

use super::{ClusterAdapter, ClusterError, Instance, ObservedRouting, RoutingState};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default bound on a single cluster call
pub const DEFAULT_CLUSTER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TimeoutAdapter<C> {
    inner: C,
    timeout: Duration,
}

impl<C: ClusterAdapter> TimeoutAdapter<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, ClusterError>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Cluster call timed out"
                );
                Err(ClusterError::ClusterUnreachable(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl<C: ClusterAdapter> ClusterAdapter for TimeoutAdapter<C> {
    async fn list_instances(&self, version: Option<&str>) -> Result<Vec<Instance>, ClusterError> {
        self.bounded("list_instances", self.inner.list_instances(version))
            .await
    }

    async fn group_replicas(&self, version: &str) -> Result<i32, ClusterError> {
        self.bounded("group_replicas", self.inner.group_replicas(version))
            .await
    }

    async fn set_group_replicas(&self, version: &str, replicas: i32) -> Result<(), ClusterError> {
        self.bounded(
            "set_group_replicas",
            self.inner.set_group_replicas(version, replicas),
        )
        .await
    }

    async fn routing(&self) -> Result<ObservedRouting, ClusterError> {
        self.bounded("routing", self.inner.routing()).await
    }

    async fn set_routing(
        &self,
        state: &RoutingState,
        expected_revision: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.bounded(
            "set_routing",
            self.inner.set_routing(state, expected_revision),
        )
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError> {
        self.bounded("delete_instance", self.inner.delete_instance(name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockCluster;

    #[tokio::test]
    async fn test_slow_call_maps_to_cluster_unreachable() {
        let mock = MockCluster::builder().group("blue", 2).build();
        mock.set_latency(Duration::from_secs(2));
        let adapter = TimeoutAdapter::new(mock, Duration::from_millis(50));

        let err = adapter.list_instances(None).await.unwrap_err();
        assert!(
            matches!(err, ClusterError::ClusterUnreachable(ref msg) if msg.contains("list_instances")),
            "expected timeout, got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let mock = MockCluster::builder().group("blue", 2).build();
        let adapter = TimeoutAdapter::new(mock, DEFAULT_CLUSTER_TIMEOUT);

        let instances = adapter.list_instances(Some("blue")).await.unwrap();
        assert_eq!(instances.len(), 2);
    }

    #[tokio::test]
    async fn test_inner_errors_are_not_rewritten() {
        let mock = MockCluster::builder().group("blue", 2).build();
        let adapter = TimeoutAdapter::new(mock, DEFAULT_CLUSTER_TIMEOUT);

        let err = adapter.group_replicas("purple").await.unwrap_err();
        assert_eq!(err, ClusterError::GroupNotFound("purple".to_string()));
    }
}
