//! Cluster adapter: the only seam between the controller and the orchestrator
//!
//! Every other component talks to the cluster through [`ClusterAdapter`].
//! Production code uses [`KubeCluster`] wrapped in a [`TimeoutAdapter`];
//! tests use `MockCluster`, an in-memory cluster that enforces replica
//! counts the way a real ReplicaSet controller would.

mod kubernetes;
mod timeout;

#[cfg(test)]
pub mod mock;

pub use kubernetes::{KubeCluster, KubeClusterConfig, ROUTING_MODE_ANNOTATION};
pub use timeout::{TimeoutAdapter, DEFAULT_CLUSTER_TIMEOUT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by cluster adapter calls
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Transport failure or timeout. Retryable with backoff.
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),

    /// No workload group exists for the version
    #[error("workload group not found for version {0}")]
    GroupNotFound(String),

    /// The routing object changed since the caller read it
    #[error("routing object was modified concurrently: {0}")]
    RoutingConflict(String),

    /// The routing object itself does not exist
    #[error("routing object {0} not found")]
    RoutingNotFound(String),

    /// The API server rejected the request for any other reason
    #[error("cluster API rejected request: {0}")]
    Api(String),
}

/// Instance health derived from the orchestrator's readiness signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Pending,
}

/// One running copy of the workload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Cluster-assigned name
    pub name: String,
    pub version: String,
    pub health: Health,
    /// Free-form lifecycle phase for diagnostics (Pending, Running, Terminating...)
    pub lifecycle_phase: String,
}

/// The live routing object's content
///
/// A weighted state always holds valid [`Weights`], whether it was built
/// through [`RoutingState::weighted`] or deserialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RoutingState {
    /// 100% of traffic to one version
    #[serde(rename_all = "camelCase")]
    Exclusive { active_version: String },

    /// Traffic split by percentage across at most two versions
    Weighted { weights: Weights },
}

/// Percentages per version: one or two entries summing to 100
///
/// The map is private, so the only ways in are [`TryFrom`] and
/// deserialization, which share the same checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<String, u32>", into = "BTreeMap<String, u32>")]
pub struct Weights(BTreeMap<String, u32>);

impl Weights {
    /// Percentage for `version`, zero when absent
    pub fn get(&self, version: &str) -> u32 {
        self.0.get(version).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.0.iter()
    }
}

impl TryFrom<BTreeMap<String, u32>> for Weights {
    type Error = WeightError;

    fn try_from(weights: BTreeMap<String, u32>) -> Result<Self, Self::Error> {
        if weights.is_empty() {
            return Err(WeightError::Empty);
        }
        if weights.len() > 2 {
            return Err(WeightError::TooManyVersions(weights.len()));
        }
        let sum: u32 = weights.values().sum();
        if sum != 100 {
            return Err(WeightError::BadSum(sum));
        }
        Ok(Weights(weights))
    }
}

impl From<Weights> for BTreeMap<String, u32> {
    fn from(weights: Weights) -> Self {
        weights.0
    }
}

/// Why a weight map was rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WeightError {
    #[error("weights must name at least one version")]
    Empty,

    #[error("at most two versions can share traffic, got {0}")]
    TooManyVersions(usize),

    #[error("weights must sum to 100, got {0}")]
    BadSum(u32),
}

impl RoutingState {
    pub fn exclusive(version: impl Into<String>) -> Self {
        RoutingState::Exclusive {
            active_version: version.into(),
        }
    }

    /// Build a weighted routing state, validating the weight invariant
    pub fn weighted(weights: BTreeMap<String, u32>) -> Result<Self, WeightError> {
        Ok(RoutingState::Weighted {
            weights: Weights::try_from(weights)?,
        })
    }

    /// Percentage of traffic a version receives under this state
    pub fn weight_of(&self, version: &str) -> u32 {
        match self {
            RoutingState::Exclusive { active_version } if active_version == version => 100,
            RoutingState::Exclusive { .. } => 0,
            RoutingState::Weighted { weights } => weights.get(version),
        }
    }

    /// The version that receives all traffic, if any
    pub fn active_version(&self) -> Option<&str> {
        match self {
            RoutingState::Exclusive { active_version } => Some(active_version),
            RoutingState::Weighted { weights } => weights
                .iter()
                .find(|(_, w)| **w == 100)
                .map(|(v, _)| v.as_str()),
        }
    }
}

/// Routing state as read from the cluster, with the revision used for
/// optimistic concurrency on the next write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedRouting {
    #[serde(flatten)]
    pub state: RoutingState,
    pub revision: Option<String>,
}

/// Interface to the orchestration API
///
/// Every operation must be safe to retry. Mutations are single atomic
/// calls, so a failure never leaves routing or replica counts half-written.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    /// List instances, optionally filtered by version label
    async fn list_instances(&self, version: Option<&str>) -> Result<Vec<Instance>, ClusterError>;

    /// Desired replica count of a workload group
    async fn group_replicas(&self, version: &str) -> Result<i32, ClusterError>;

    /// Set a workload group's desired replica count (no-op when unchanged)
    async fn set_group_replicas(&self, version: &str, replicas: i32) -> Result<(), ClusterError>;

    /// Read the routing object
    async fn routing(&self) -> Result<ObservedRouting, ClusterError>;

    /// Replace the routing object's content in one call
    ///
    /// When `expected_revision` is set and the object has moved on,
    /// fails with `RoutingConflict`.
    async fn set_routing(
        &self,
        state: &RoutingState,
        expected_revision: Option<&str>,
    ) -> Result<(), ClusterError>;

    /// Request deletion of one instance. A missing instance is not an error.
    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError>;
}
