//! Strategy engine: drives the single active strategy run
//!
//! Runs are stepped explicitly (deploy executes the first step, advance
//! each later one). A step performs at most one cluster mutation and never
//! waits on the cluster for health; "wait until healthy" is the next
//! advance call looking at a newer registry snapshot.
//!
//! Concurrency:
//! - The active run lives behind a tokio mutex. `advance` only try-locks
//!   and reports `StepInProgress` instead of queueing a second step.
//! - `deploy`, `abort` and `reset` wait for an in-flight step to finish its
//!   mutation and then supersede the run. Starting a new strategy always
//!   replaces the active one; there is no queueing.
//! - Status reads use a watch-published copy and never take the lock.

use crate::cluster::ClusterAdapter;
use crate::controller::clock::Clock;
use crate::controller::registry::PodRegistry;
use crate::controller::router::TrafficRouter;
use crate::controller::strategies::{
    Action, BlueGreen, Canary, Rollout, StepView, Strategy, StrategyKind, Transition,
};
use crate::controller::ControllerError;
use crate::server::SharedMetrics;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transient state of one strategy execution
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRun {
    pub id: Uuid,
    #[serde(flatten)]
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub last_step_at: Option<DateTime<Utc>>,
    /// Steps executed so far, including waiting steps
    pub steps: u32,
    pub message: Option<String>,
}

impl StrategyRun {
    fn new(strategy: Strategy, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            started_at: now,
            last_step_at: None,
            steps: 0,
            message: None,
        }
    }

    fn stepped(self, transition: Transition, now: DateTime<Utc>) -> Self {
        Self {
            strategy: transition.next,
            last_step_at: Some(now),
            steps: self.steps + 1,
            message: Some(transition.message),
            ..self
        }
    }

    pub fn phase(&self) -> &'static str {
        self.strategy.phase()
    }
}

/// Body of a deploy request
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub strategy: StrategyKind,
    pub target: String,
    /// Version being replaced; defaults to the currently live version
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub initial_weight: Option<u32>,
    #[serde(default)]
    pub increment: Option<u32>,
    #[serde(default)]
    pub step_size: Option<i32>,
}

impl DeployRequest {
    pub fn new(strategy: StrategyKind, target: impl Into<String>) -> Self {
        Self {
            strategy,
            target: target.into(),
            from: None,
            initial_weight: None,
            increment: None,
            step_size: None,
        }
    }
}

/// Engine knobs taken from controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Versions in play; the first is not special
    pub versions: Vec<String>,
    /// Version routed exclusively after reset
    pub default_version: String,
    /// Replicas per workload group after reset
    pub baseline_replicas: i32,
    pub canary_initial_weight: u32,
    pub canary_increment: u32,
    pub rollout_step_size: i32,
}

/// Published view of runs for status reads
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub active: Option<StrategyRun>,
    /// Most recent run that reached a terminal phase
    pub last: Option<StrategyRun>,
}

pub struct StrategyEngine {
    cluster: Arc<dyn ClusterAdapter>,
    registry: Arc<PodRegistry>,
    router: Arc<TrafficRouter>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    metrics: Option<SharedMetrics>,
    active: Mutex<Option<StrategyRun>>,
    published: watch::Sender<RunSummary>,
}

impl StrategyEngine {
    pub fn new(
        cluster: Arc<dyn ClusterAdapter>,
        registry: Arc<PodRegistry>,
        router: Arc<TrafficRouter>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let (published, _) = watch::channel(RunSummary::default());
        Self {
            cluster,
            registry,
            router,
            clock,
            settings,
            metrics,
            active: Mutex::new(None),
            published,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Active and last-finished runs, without waiting on an in-flight step
    pub fn runs(&self) -> RunSummary {
        self.published.borrow().clone()
    }

    pub fn active_run(&self) -> Option<StrategyRun> {
        self.published.borrow().active.clone()
    }

    /// Start a strategy, superseding any active run
    ///
    /// The first step executes immediately. If it fails the new run is
    /// discarded and the previously active run, if any, is left in place.
    pub async fn deploy(&self, request: DeployRequest) -> Result<StrategyRun, ControllerError> {
        let strategy = self.build_strategy(&request).await?;

        let mut slot = self.active.lock().await;
        let run = StrategyRun::new(strategy, self.clock.now());
        info!(
            run = %run.id,
            strategy = %request.strategy,
            target = %request.target,
            "Starting strategy run"
        );

        let run = self.execute_step(run).await?;
        if let Some(previous) = slot.as_ref() {
            info!(
                superseded = %previous.id,
                strategy = %previous.strategy.kind(),
                phase = previous.phase(),
                "Active run superseded"
            );
        }
        self.install(&mut slot, run.clone());
        Ok(run)
    }

    /// Execute one step of the active run; `None` when nothing is active
    pub async fn advance(&self) -> Result<Option<StrategyRun>, ControllerError> {
        let mut slot = self
            .active
            .try_lock()
            .map_err(|_| ControllerError::StepInProgress)?;
        let Some(run) = slot.clone() else {
            debug!("Advance requested with no active run");
            return Ok(None);
        };

        let run = self.execute_step(run).await?;
        self.install(&mut slot, run.clone());
        Ok(Some(run))
    }

    /// Abort the active canary run, sending all traffic back to its source
    pub async fn abort(&self) -> Result<Option<StrategyRun>, ControllerError> {
        let mut slot = self.active.lock().await;
        let Some(run) = slot.clone() else {
            return Ok(None);
        };
        let Strategy::Canary(canary) = &run.strategy else {
            return Err(ControllerError::NotAbortable(run.strategy.kind().as_str()));
        };

        let transition = canary.abort();
        let run = self.apply(run, transition).await?;
        warn!(run = %run.id, "Canary run aborted");
        self.install(&mut slot, run.clone());
        Ok(Some(run))
    }

    /// Clear the active run and restore the baseline: every workload group
    /// at the baseline replica count and all traffic on the default version
    pub async fn reset(&self) -> Result<(), ControllerError> {
        let mut slot = self.active.lock().await;
        if let Some(run) = slot.take() {
            info!(run = %run.id, phase = run.phase(), "Active run cleared by reset");
        }
        self.published.send_modify(|summary| summary.active = None);

        let baseline = self.settings.baseline_replicas;
        try_join_all(
            self.settings
                .versions
                .iter()
                .map(|v| self.cluster.set_group_replicas(v, baseline)),
        )
        .await?;
        self.router
            .switch_exclusive(&self.settings.default_version)
            .await?;

        info!(
            default_version = %self.settings.default_version,
            baseline_replicas = baseline,
            "Controller reset to baseline"
        );
        Ok(())
    }

    async fn build_strategy(&self, request: &DeployRequest) -> Result<Strategy, ControllerError> {
        self.check_version(&request.target)?;
        if let Some(from) = &request.from {
            self.check_version(from)?;
        }

        match request.strategy {
            StrategyKind::BlueGreen => {
                Ok(Strategy::BlueGreen(BlueGreen::new(request.target.clone())))
            }
            StrategyKind::Canary => Ok(Strategy::Canary(Canary::new(
                self.resolve_source(request).await?,
                request.target.clone(),
                request
                    .initial_weight
                    .unwrap_or(self.settings.canary_initial_weight),
                request.increment.unwrap_or(self.settings.canary_increment),
            )?)),
            StrategyKind::Rollout => Ok(Strategy::Rollout(Rollout::new(
                self.resolve_source(request).await?,
                request.target.clone(),
                request.step_size.unwrap_or(self.settings.rollout_step_size),
            )?)),
        }
    }

    async fn resolve_source(&self, request: &DeployRequest) -> Result<String, ControllerError> {
        let source = match &request.from {
            Some(from) => from.clone(),
            None => self.default_source(&request.target).await?,
        };
        if source == request.target {
            return Err(ControllerError::InvalidRequest(format!(
                "source and target are both {}",
                source
            )));
        }
        Ok(source)
    }

    fn check_version(&self, version: &str) -> Result<(), ControllerError> {
        if self.settings.versions.iter().any(|v| v == version) {
            Ok(())
        } else {
            Err(ControllerError::InvalidRequest(format!(
                "unknown version {} (known: {})",
                version,
                self.settings.versions.join(", ")
            )))
        }
    }

    /// The live version if it differs from the target, else the first other
    /// configured version
    async fn default_source(&self, target: &str) -> Result<String, ControllerError> {
        match self.router.current_routing().await {
            Ok(observed) => {
                if let Some(active) = observed.state.active_version() {
                    if active != target {
                        return Ok(active.to_string());
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Routing unreadable, picking source from configuration");
            }
        }

        self.settings
            .versions
            .iter()
            .find(|v| v.as_str() != target)
            .cloned()
            .ok_or_else(|| {
                ControllerError::InvalidRequest(format!("no version to replace with {}", target))
            })
    }

    async fn step_view(&self, strategy: &Strategy) -> Result<StepView, ControllerError> {
        let snapshot = self.registry.snapshot().await;
        let mut view = StepView {
            counts: snapshot.counts(),
            ..Default::default()
        };
        for group in strategy.groups() {
            let desired = self.cluster.group_replicas(group).await?;
            view.desired.insert(group.to_string(), desired);
        }
        Ok(view)
    }

    async fn execute_step(&self, run: StrategyRun) -> Result<StrategyRun, ControllerError> {
        let kind = run.strategy.kind();
        let result = async {
            let view = self.step_view(&run.strategy).await?;
            let transition = run.strategy.plan(&view)?;
            self.apply(run, transition).await
        }
        .await;

        match &result {
            Ok(run) => {
                info!(
                    run = %run.id,
                    strategy = %kind,
                    phase = run.phase(),
                    step = run.steps,
                    message = run.message.as_deref().unwrap_or(""),
                    "Strategy step executed"
                );
                self.record_step(kind, "ok");
            }
            Err(e) => {
                warn!(strategy = %kind, error = %e, "Strategy step failed, phase unchanged");
                self.record_step(kind, e.kind());
            }
        }
        result
    }

    /// Perform the transition's action, then commit the next state
    async fn apply(
        &self,
        run: StrategyRun,
        transition: Transition,
    ) -> Result<StrategyRun, ControllerError> {
        match &transition.action {
            Some(Action::SwitchExclusive(version)) => {
                self.router.switch_exclusive(version).await?;
            }
            Some(Action::SetWeights(weights)) => {
                self.router.set_weights(weights.clone()).await?;
            }
            Some(Action::ScaleGroup { version, replicas }) => {
                self.cluster.set_group_replicas(version, *replicas).await?;
            }
            None => {}
        }
        Ok(run.stepped(transition, self.clock.now()))
    }

    /// Store the run as active, or clear the slot if it finished
    fn install(&self, slot: &mut Option<StrategyRun>, run: StrategyRun) {
        if run.strategy.is_terminal() {
            info!(run = %run.id, phase = run.phase(), "Strategy run finished");
            *slot = None;
            self.published.send_modify(|summary| {
                summary.active = None;
                summary.last = Some(run);
            });
        } else {
            *slot = Some(run.clone());
            self.published
                .send_modify(|summary| summary.active = Some(run));
        }
    }

    fn record_step(&self, kind: StrategyKind, outcome: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_strategy_step(kind.as_str(), outcome);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "engine_test.rs"]
mod tests;
