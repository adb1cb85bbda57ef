//! In-memory cluster for tests
//!
//! Behaves like a tiny orchestrator: every workload group's instance count
//! is reconciled to its desired replicas immediately after each mutation,
//! so deleting an instance produces a replacement with a fresh name.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{ClusterAdapter, ClusterError, Health, Instance, ObservedRouting, RoutingState};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    groups: BTreeMap<String, i32>,
    instances: Vec<Instance>,
    routing: Option<RoutingState>,
    revision: u64,
    next_id: u64,
    new_instances_pending: bool,
    self_heal: bool,
    latency: Duration,
    fail_next: Option<ClusterError>,
    edit_after_read: Option<RoutingState>,
    mutations: Vec<String>,
}

impl MockState {
    fn spawn(&mut self, version: &str) {
        self.next_id += 1;
        let (health, phase) = if self.new_instances_pending {
            (Health::Pending, "Pending")
        } else {
            (Health::Healthy, "Running")
        };
        self.instances.push(Instance {
            name: format!("web-{}-{:05}", version, self.next_id),
            version: version.to_string(),
            health,
            lifecycle_phase: phase.to_string(),
        });
    }

    /// Converge a group's instance count on its desired replicas
    fn reconcile(&mut self, version: &str) {
        let desired = self.groups.get(version).copied().unwrap_or(0).max(0) as usize;
        let current = self.instances.iter().filter(|i| i.version == version).count();
        if current < desired {
            for _ in current..desired {
                self.spawn(version);
            }
        } else if current > desired {
            let mut excess = current - desired;
            // Remove newest first, like a ReplicaSet scaling down
            let mut i = self.instances.len();
            while excess > 0 && i > 0 {
                i -= 1;
                if self.instances[i].version == version {
                    self.instances.remove(i);
                    excess -= 1;
                }
            }
        }
    }
}

/// Cloneable handle to a shared in-memory cluster
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
}

pub struct MockClusterBuilder {
    state: MockState,
}

impl MockClusterBuilder {
    /// Add a workload group with `replicas` healthy instances
    pub fn group(mut self, version: &str, replicas: i32) -> Self {
        self.state.groups.insert(version.to_string(), replicas);
        self.state.reconcile(version);
        self
    }

    pub fn routing(mut self, state: RoutingState) -> Self {
        self.state.routing = Some(state);
        self.state.revision = 1;
        self
    }

    /// Instances created after build start in `Pending`
    pub fn pending_replacements(mut self) -> Self {
        self.state.new_instances_pending = true;
        self
    }

    /// Disable replica enforcement on delete (instance simply disappears)
    pub fn without_self_heal(mut self) -> Self {
        self.state.self_heal = false;
        self
    }

    pub fn build(self) -> MockCluster {
        MockCluster {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

impl MockCluster {
    pub fn builder() -> MockClusterBuilder {
        MockClusterBuilder {
            state: MockState {
                self_heal: true,
                ..Default::default()
            },
        }
    }

    /// Blue/green pair with `blue` live, both at `replicas` healthy instances
    pub fn blue_green(replicas: i32) -> Self {
        Self::builder()
            .group("blue", replicas)
            .group("green", replicas)
            .routing(RoutingState::exclusive("blue"))
            .build()
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Make the next adapter call fail with `error`
    pub fn fail_next(&self, error: ClusterError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }

    pub fn set_pending_replacements(&self, pending: bool) {
        self.state.lock().unwrap().new_instances_pending = pending;
    }

    /// Mark every instance of a version healthy
    pub fn mark_healthy(&self, version: &str) {
        let mut state = self.state.lock().unwrap();
        for instance in state.instances.iter_mut().filter(|i| i.version == version) {
            instance.health = Health::Healthy;
            instance.lifecycle_phase = "Running".to_string();
        }
    }

    /// Mark every instance of a version unhealthy
    pub fn mark_unhealthy(&self, version: &str) {
        let mut state = self.state.lock().unwrap();
        for instance in state.instances.iter_mut().filter(|i| i.version == version) {
            instance.health = Health::Unhealthy;
        }
    }

    /// Mutate the routing object out of band, as a human operator would
    pub fn external_set_routing(&self, routing: RoutingState) {
        let mut state = self.state.lock().unwrap();
        state.routing = Some(routing);
        state.revision += 1;
    }

    /// Apply an out-of-band routing edit right after the next routing read
    ///
    /// The reader gets the old revision, so its follow-up write is stale.
    pub fn external_edit_after_next_read(&self, routing: RoutingState) {
        self.state.lock().unwrap().edit_after_read = Some(routing);
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state.lock().unwrap().instances.clone()
    }

    pub fn instance_names(&self, version: &str) -> Vec<String> {
        self.instances()
            .into_iter()
            .filter(|i| i.version == version)
            .map(|i| i.name)
            .collect()
    }

    pub fn desired(&self, version: &str) -> Option<i32> {
        self.state.lock().unwrap().groups.get(version).copied()
    }

    pub fn current_routing(&self) -> Option<RoutingState> {
        self.state.lock().unwrap().routing.clone()
    }

    /// Mutating calls that reached the cluster, in order
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    async fn enter(&self) -> Result<(), ClusterError> {
        let latency = self.state.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.state.lock().unwrap().fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterAdapter for MockCluster {
    async fn list_instances(&self, version: Option<&str>) -> Result<Vec<Instance>, ClusterError> {
        self.enter().await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .filter(|i| version.is_none_or(|v| i.version == v))
            .cloned()
            .collect())
    }

    async fn group_replicas(&self, version: &str) -> Result<i32, ClusterError> {
        self.enter().await?;
        self.state
            .lock()
            .unwrap()
            .groups
            .get(version)
            .copied()
            .ok_or_else(|| ClusterError::GroupNotFound(version.to_string()))
    }

    async fn set_group_replicas(&self, version: &str, replicas: i32) -> Result<(), ClusterError> {
        self.enter().await?;
        let mut state = self.state.lock().unwrap();
        let current = state
            .groups
            .get(version)
            .copied()
            .ok_or_else(|| ClusterError::GroupNotFound(version.to_string()))?;
        if current == replicas {
            return Ok(());
        }
        state.groups.insert(version.to_string(), replicas);
        state.mutations.push(format!("scale {}={}", version, replicas));
        state.reconcile(version);
        Ok(())
    }

    async fn routing(&self) -> Result<ObservedRouting, ClusterError> {
        self.enter().await?;
        let mut state = self.state.lock().unwrap();
        let routing = state
            .routing
            .clone()
            .ok_or_else(|| ClusterError::RoutingNotFound("web-route".to_string()))?;
        let observed = ObservedRouting {
            state: routing,
            revision: Some(state.revision.to_string()),
        };
        if let Some(edit) = state.edit_after_read.take() {
            state.routing = Some(edit);
            state.revision += 1;
        }
        Ok(observed)
    }

    async fn set_routing(
        &self,
        routing: &RoutingState,
        expected_revision: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.enter().await?;
        let mut state = self.state.lock().unwrap();
        if state.routing.is_none() {
            return Err(ClusterError::RoutingNotFound("web-route".to_string()));
        }
        if let Some(expected) = expected_revision {
            if expected != state.revision.to_string() {
                return Err(ClusterError::RoutingConflict(format!(
                    "expected revision {}, found {}",
                    expected, state.revision
                )));
            }
        }
        state.routing = Some(routing.clone());
        state.revision += 1;
        state.mutations.push(format!("route {:?}", routing));
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError> {
        self.enter().await?;
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.instances.iter().position(|i| i.name == name) else {
            return Ok(());
        };
        let removed = state.instances.remove(pos);
        state.mutations.push(format!("delete {}", name));
        if state.self_heal {
            state.reconcile(&removed.version);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_revision_write_is_a_conflict() {
        let cluster = MockCluster::blue_green(1);
        let observed = cluster.routing().await.unwrap();
        cluster.external_set_routing(RoutingState::exclusive("green"));

        let err = cluster
            .set_routing(&RoutingState::exclusive("blue"), observed.revision.as_deref())
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::RoutingConflict(_)));
        assert_eq!(cluster.current_routing(), Some(RoutingState::exclusive("green")));
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_write_with_current_revision_succeeds() {
        let cluster = MockCluster::blue_green(1);
        let observed = cluster.routing().await.unwrap();

        cluster
            .set_routing(&RoutingState::exclusive("green"), observed.revision.as_deref())
            .await
            .unwrap();

        let after = cluster.routing().await.unwrap();
        assert_eq!(after.state, RoutingState::exclusive("green"));
        assert_ne!(after.revision, observed.revision);
    }

    #[tokio::test]
    async fn test_edit_after_read_returns_old_state() {
        let cluster = MockCluster::blue_green(1);
        cluster.external_edit_after_next_read(RoutingState::exclusive("green"));

        let observed = cluster.routing().await.unwrap();

        assert_eq!(observed.state, RoutingState::exclusive("blue"));
        assert_eq!(cluster.current_routing(), Some(RoutingState::exclusive("green")));
    }
}
