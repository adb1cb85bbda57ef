//! Deployment strategies as a tagged variant
//!
//! Each strategy is a small state machine with a pure transition function:
//! given the current state and a [`StepView`] (last registry snapshot plus
//! desired replica counts), `plan` returns the next state and at most one
//! [`Action`] for the engine to perform. The engine commits the next state
//! only after the action succeeds, so a failed step never half-advances.
//!
//! - BlueGreen: one exclusive routing switch
//! - Rollout: scale-up/drain-down pairs at the workload group level
//! - Canary: weighted traffic steps toward 100%

pub mod blue_green;
pub mod canary;
pub mod rollout;

pub use blue_green::{BlueGreen, BlueGreenPhase};
pub use canary::{Canary, CanaryPhase};
pub use rollout::{Rollout, RolloutPhase};

use crate::cluster::ClusterError;
use crate::controller::registry::VersionCount;
use crate::controller::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    BlueGreen,
    Rollout,
    Canary,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::BlueGreen => "blue-green",
            StrategyKind::Rollout => "rollout",
            StrategyKind::Canary => "canary",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue-green" => Ok(StrategyKind::BlueGreen),
            "rollout" => Ok(StrategyKind::Rollout),
            "canary" => Ok(StrategyKind::Canary),
            other => Err(ControllerError::InvalidRequest(format!(
                "unknown strategy {}",
                other
            ))),
        }
    }
}

/// The single cluster mutation a step asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SwitchExclusive(String),
    SetWeights(BTreeMap<String, u32>),
    ScaleGroup { version: String, replicas: i32 },
}

/// Everything a transition function may look at
#[derive(Debug, Clone, Default)]
pub struct StepView {
    /// Per-version counts from the last registry snapshot
    pub counts: BTreeMap<String, VersionCount>,
    /// Desired replicas of the run's workload groups
    pub desired: BTreeMap<String, i32>,
}

impl StepView {
    pub fn healthy(&self, version: &str) -> usize {
        self.counts.get(version).map(|c| c.healthy).unwrap_or(0)
    }

    pub fn desired(&self, version: &str) -> Result<i32, ControllerError> {
        self.desired
            .get(version)
            .copied()
            .ok_or_else(|| ClusterError::GroupNotFound(version.to_string()).into())
    }

    /// Fail with `InsufficientCapacity` unless `version` has `required` healthy instances
    pub fn require_healthy(&self, version: &str, required: usize) -> Result<(), ControllerError> {
        let healthy = self.healthy(version);
        if healthy < required {
            return Err(ControllerError::InsufficientCapacity {
                version: version.to_string(),
                healthy,
                required,
            });
        }
        Ok(())
    }
}

/// Result of one planned step
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Strategy,
    pub action: Option<Action>,
    pub message: String,
}

impl Transition {
    /// A step that changes nothing and waits for the cluster to catch up
    pub fn wait(current: &Strategy, message: impl Into<String>) -> Self {
        Transition {
            next: current.clone(),
            action: None,
            message: message.into(),
        }
    }
}

/// State of one strategy run
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Strategy {
    BlueGreen(BlueGreen),
    Rollout(Rollout),
    Canary(Canary),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::BlueGreen(_) => StrategyKind::BlueGreen,
            Strategy::Rollout(_) => StrategyKind::Rollout,
            Strategy::Canary(_) => StrategyKind::Canary,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            Strategy::BlueGreen(s) => s.phase.as_str(),
            Strategy::Rollout(s) => s.phase.as_str(),
            Strategy::Canary(s) => s.phase.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Strategy::BlueGreen(s) => s.phase == BlueGreenPhase::Switched,
            Strategy::Rollout(s) => s.phase == RolloutPhase::Done,
            Strategy::Canary(s) => {
                matches!(s.phase, CanaryPhase::Promoted | CanaryPhase::Aborted)
            }
        }
    }

    /// Workload groups whose desired replicas the next step needs
    pub fn groups(&self) -> Vec<&str> {
        match self {
            Strategy::BlueGreen(s) => vec![s.target.as_str()],
            Strategy::Rollout(s) if s.needs_baseline() => {
                vec![s.source.as_str(), s.target.as_str()]
            }
            Strategy::Rollout(_) | Strategy::Canary(_) => vec![],
        }
    }

    pub fn plan(&self, view: &StepView) -> Result<Transition, ControllerError> {
        match self {
            Strategy::BlueGreen(s) => s.plan(view),
            Strategy::Rollout(s) => s.plan(view),
            Strategy::Canary(s) => s.plan(view),
        }
    }
}
