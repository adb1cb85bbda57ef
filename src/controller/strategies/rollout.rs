//! Progressive rollout: replace the source version with the target version
//! one scaling unit at a time
//!
//! Works purely on workload group replica counts and never touches routing.
//! Each pair of steps scales the target up by one unit, waits (across
//! subsequent steps) for that capacity to become healthy, then drains the
//! source by the same unit. Target desired never decreases, source desired
//! never increases, and their sum never exceeds the original total by more
//! than one unit.

use super::{Action, StepView, Strategy, Transition};
use crate::controller::ControllerError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RolloutPhase {
    Scaling,
    Draining,
    Done,
}

impl RolloutPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutPhase::Scaling => "scaling",
            RolloutPhase::Draining => "draining",
            RolloutPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub source: String,
    pub target: String,
    pub step_size: i32,
    pub phase: RolloutPhase,
    /// Source + target desired replicas when the run started
    pub original_total: Option<i32>,
    pub source_desired: Option<i32>,
    pub target_desired: Option<i32>,
    /// Unit scaled up and not yet drained from the source
    pub pending_unit: Option<i32>,
}

impl Rollout {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        step_size: i32,
    ) -> Result<Self, ControllerError> {
        if step_size < 1 {
            return Err(ControllerError::InvalidRequest(format!(
                "stepSize must be >= 1, got {}",
                step_size
            )));
        }
        Ok(Self {
            source: source.into(),
            target: target.into(),
            step_size,
            phase: RolloutPhase::Scaling,
            original_total: None,
            source_desired: None,
            target_desired: None,
            pending_unit: None,
        })
    }

    /// Desired counts are captured from the cluster on the first step only
    pub(super) fn needs_baseline(&self) -> bool {
        self.original_total.is_none()
    }

    pub(super) fn plan(&self, view: &StepView) -> Result<Transition, ControllerError> {
        let (source_desired, target_desired, total) =
            match (self.source_desired, self.target_desired, self.original_total) {
                (Some(s), Some(t), Some(total)) => (s, t, total),
                _ => {
                    let s = view.desired(&self.source)?;
                    let t = view.desired(&self.target)?;
                    (s, t, s + t)
                }
            };
        let base = Rollout {
            original_total: Some(total),
            source_desired: Some(source_desired),
            target_desired: Some(target_desired),
            ..self.clone()
        };

        match (self.phase, self.pending_unit) {
            (RolloutPhase::Done, _) => Ok(Transition::wait(
                &Strategy::Rollout(base),
                "rollout complete",
            )),
            (RolloutPhase::Scaling, Some(unit)) => {
                let healthy = view.healthy(&self.target);
                if healthy < target_desired.max(0) as usize {
                    let message = format!(
                        "waiting for {}: {}/{} healthy",
                        self.target, healthy, target_desired
                    );
                    return Ok(Transition::wait(&Strategy::Rollout(base), message));
                }
                Ok(base.drain(unit))
            }
            (RolloutPhase::Scaling, None) | (RolloutPhase::Draining, _) => {
                if source_desired == 0 {
                    return Ok(base.finish());
                }
                Ok(base.scale_up())
            }
        }
    }

    fn scale_up(self) -> Transition {
        let (source, target, total) = self.counts();
        let unit = self.step_size.min(source);
        let next_target = (target + unit).min(total);
        let message = format!(
            "scaling {} to {} replicas ({} remaining on {})",
            self.target, next_target, source, self.source
        );
        Transition {
            action: Some(Action::ScaleGroup {
                version: self.target.clone(),
                replicas: next_target,
            }),
            next: Strategy::Rollout(Rollout {
                phase: RolloutPhase::Scaling,
                target_desired: Some(next_target),
                pending_unit: Some(unit),
                ..self
            }),
            message,
        }
    }

    fn drain(self, unit: i32) -> Transition {
        let (source, target, total) = self.counts();
        let next_source = (source - unit).max(0);
        let phase = if next_source == 0 && target == total {
            RolloutPhase::Done
        } else {
            RolloutPhase::Draining
        };
        let message = format!(
            "draining {} to {} replicas ({} on {})",
            self.source, next_source, target, self.target
        );
        Transition {
            action: Some(Action::ScaleGroup {
                version: self.source.clone(),
                replicas: next_source,
            }),
            next: Strategy::Rollout(Rollout {
                phase,
                source_desired: Some(next_source),
                pending_unit: None,
                ..self
            }),
            message,
        }
    }

    fn finish(self) -> Transition {
        let (_, target, total) = self.counts();
        // Source already empty: make sure the target carries the full total
        if target < total {
            return Transition {
                action: Some(Action::ScaleGroup {
                    version: self.target.clone(),
                    replicas: total,
                }),
                message: format!("scaling {} to full size {}", self.target, total),
                next: Strategy::Rollout(Rollout {
                    phase: RolloutPhase::Scaling,
                    target_desired: Some(total),
                    pending_unit: Some(0),
                    ..self
                }),
            };
        }
        Transition {
            message: format!("{} fully replaced by {}", self.source, self.target),
            action: None,
            next: Strategy::Rollout(Rollout {
                phase: RolloutPhase::Done,
                pending_unit: None,
                ..self
            }),
        }
    }

    fn counts(&self) -> (i32, i32, i32) {
        (
            self.source_desired.unwrap_or(0),
            self.target_desired.unwrap_or(0),
            self.original_total.unwrap_or(0),
        )
    }
}
