use crate::cluster::{ClusterError, WeightError};
use thiserror::Error;

/// Errors surfaced by the router, engine and control API
///
/// Cluster errors pass through unchanged so callers can tell a retryable
/// transport failure from a state mismatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Rejected weight map; nothing was sent to the cluster
    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    /// A version lacks the healthy capacity the step requires
    #[error("version {version} has {healthy} healthy instance(s), {required} required")]
    InsufficientCapacity {
        version: String,
        healthy: usize,
        required: usize,
    },

    /// Another step of the active run is executing
    #[error("a strategy step is already in progress")]
    StepInProgress,

    /// Only canary runs can be aborted
    #[error("{0} runs cannot be aborted")]
    NotAbortable(&'static str),

    /// Malformed control request (unknown version, same source and target...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControllerError {
    /// Stable error kind reported to API callers
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Cluster(ClusterError::ClusterUnreachable(_)) => "ClusterUnreachable",
            ControllerError::Cluster(ClusterError::GroupNotFound(_)) => "GroupNotFound",
            ControllerError::Cluster(ClusterError::RoutingConflict(_)) => "RoutingConflict",
            ControllerError::Cluster(ClusterError::RoutingNotFound(_)) => "RoutingNotFound",
            ControllerError::Cluster(ClusterError::Api(_)) => "Api",
            ControllerError::InvalidWeights(_) => "InvalidWeights",
            ControllerError::InsufficientCapacity { .. } => "InsufficientCapacity",
            ControllerError::StepInProgress => "StepInProgress",
            ControllerError::NotAbortable(_) => "NotAbortable",
            ControllerError::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

impl From<WeightError> for ControllerError {
    fn from(err: WeightError) -> Self {
        ControllerError::InvalidWeights(err.to_string())
    }
}
