//! Canary: progressive weighted traffic shift
//!
//! Starts the target at a small weight and moves it up by a fixed
//! increment each step until it carries 100%. Both versions must have
//! healthy capacity at every forward step. An abort sends all traffic
//! back to the source and is terminal.

use super::{Action, StepView, Strategy, Transition};
use crate::controller::ControllerError;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CanaryPhase {
    Weighted,
    Promoted,
    Aborted,
}

impl CanaryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanaryPhase::Weighted => "weighted",
            CanaryPhase::Promoted => "promoted",
            CanaryPhase::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Canary {
    pub source: String,
    pub target: String,
    pub initial_weight: u32,
    pub increment: u32,
    /// Target's current share of traffic; None before the first step
    pub weight: Option<u32>,
    pub phase: CanaryPhase,
}

fn check_percent(name: &str, value: u32) -> Result<(), ControllerError> {
    if !(1..=100).contains(&value) {
        return Err(ControllerError::InvalidRequest(format!(
            "{} must be between 1 and 100, got {}",
            name, value
        )));
    }
    Ok(())
}

impl Canary {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        initial_weight: u32,
        increment: u32,
    ) -> Result<Self, ControllerError> {
        check_percent("initialWeight", initial_weight)?;
        check_percent("increment", increment)?;
        Ok(Self {
            source: source.into(),
            target: target.into(),
            initial_weight,
            increment,
            weight: None,
            phase: CanaryPhase::Weighted,
        })
    }

    fn split(&self, target_weight: u32) -> BTreeMap<String, u32> {
        let mut weights = BTreeMap::new();
        weights.insert(self.source.clone(), 100 - target_weight);
        weights.insert(self.target.clone(), target_weight);
        weights
    }

    pub(super) fn plan(&self, view: &StepView) -> Result<Transition, ControllerError> {
        if self.phase != CanaryPhase::Weighted {
            return Ok(Transition::wait(
                &Strategy::Canary(self.clone()),
                format!("canary already {}", self.phase.as_str()),
            ));
        }

        view.require_healthy(&self.source, 1)?;
        view.require_healthy(&self.target, 1)?;

        let next_weight = match self.weight {
            None => self.initial_weight,
            Some(current) => (current + self.increment).min(100),
        };
        let phase = if next_weight == 100 {
            CanaryPhase::Promoted
        } else {
            CanaryPhase::Weighted
        };
        let message = if phase == CanaryPhase::Promoted {
            format!("{} promoted to 100% of traffic", self.target)
        } else {
            format!(
                "{} at {}%, {} at {}%",
                self.target,
                next_weight,
                self.source,
                100 - next_weight
            )
        };

        Ok(Transition {
            action: Some(Action::SetWeights(self.split(next_weight))),
            next: Strategy::Canary(Canary {
                weight: Some(next_weight),
                phase,
                ..self.clone()
            }),
            message,
        })
    }

    /// Send all traffic back to the source. Needs no target capacity.
    pub fn abort(&self) -> Transition {
        Transition {
            action: Some(Action::SetWeights(self.split(0))),
            next: Strategy::Canary(Canary {
                weight: Some(0),
                phase: CanaryPhase::Aborted,
                ..self.clone()
            }),
            message: format!("canary aborted, all traffic back to {}", self.source),
        }
    }
}
