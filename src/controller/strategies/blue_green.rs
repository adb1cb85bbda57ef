//! Blue-green: instant exclusive cutover
//!
//! Both versions are already running at full size; the step only flips the
//! routing object. Rolling back is the same step with the other version as
//! target. Nothing here remembers the previous version.
//!
//! Only the target's capacity gates the switch. The version losing traffic
//! keeps its instances, and it is often the broken one being rolled back
//! from, so requiring it to be healthy would block the rollback.

use super::{Action, StepView, Strategy, Transition};
use crate::controller::ControllerError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlueGreenPhase {
    Idle,
    Switched,
}

impl BlueGreenPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlueGreenPhase::Idle => "idle",
            BlueGreenPhase::Switched => "switched",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlueGreen {
    pub target: String,
    pub phase: BlueGreenPhase,
}

impl BlueGreen {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            phase: BlueGreenPhase::Idle,
        }
    }

    pub(super) fn plan(&self, view: &StepView) -> Result<Transition, ControllerError> {
        if self.phase == BlueGreenPhase::Switched {
            return Ok(Transition::wait(
                &Strategy::BlueGreen(self.clone()),
                format!("traffic already switched to {}", self.target),
            ));
        }

        // The target group must already be at its desired healthy size
        let desired = view.desired(&self.target)?.max(1) as usize;
        view.require_healthy(&self.target, desired)?;

        Ok(Transition {
            next: Strategy::BlueGreen(BlueGreen {
                target: self.target.clone(),
                phase: BlueGreenPhase::Switched,
            }),
            action: Some(Action::SwitchExclusive(self.target.clone())),
            message: format!("all traffic switched to {}", self.target),
        })
    }
}
