//! Prometheus metrics for the controller
//!
//! All collectors live in a private registry exposed at `/metrics`.

use crate::cluster::{Health, Instance, RoutingState};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    strategy_steps: IntCounterVec,
    instance_kills: IntCounterVec,
    registry_refreshes: IntCounterVec,
    instances: IntGaugeVec,
    traffic_weight: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let strategy_steps = IntCounterVec::new(
            Opts::new(
                "cutover_strategy_steps_total",
                "Strategy steps executed, by strategy and outcome",
            ),
            &["strategy", "outcome"],
        )?;
        let instance_kills = IntCounterVec::new(
            Opts::new(
                "cutover_instance_kills_total",
                "Chaos kill requests, by outcome",
            ),
            &["outcome"],
        )?;
        let registry_refreshes = IntCounterVec::new(
            Opts::new(
                "cutover_registry_refreshes_total",
                "Pod registry refreshes, by outcome",
            ),
            &["outcome"],
        )?;
        let instances = IntGaugeVec::new(
            Opts::new(
                "cutover_instances",
                "Instances in the last registry snapshot",
            ),
            &["version", "health"],
        )?;
        let traffic_weight = IntGaugeVec::new(
            Opts::new(
                "cutover_traffic_weight_percent",
                "Share of traffic routed to each version",
            ),
            &["version"],
        )?;

        registry.register(Box::new(strategy_steps.clone()))?;
        registry.register(Box::new(instance_kills.clone()))?;
        registry.register(Box::new(registry_refreshes.clone()))?;
        registry.register(Box::new(instances.clone()))?;
        registry.register(Box::new(traffic_weight.clone()))?;

        Ok(Self {
            registry,
            strategy_steps,
            instance_kills,
            registry_refreshes,
            instances,
            traffic_weight,
        })
    }

    pub fn record_strategy_step(&self, strategy: &str, outcome: &str) {
        self.strategy_steps
            .with_label_values(&[strategy, outcome])
            .inc();
    }

    pub fn record_kill(&self, outcome: &str) {
        self.instance_kills.with_label_values(&[outcome]).inc();
    }

    pub fn record_registry_refresh(&self, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.registry_refreshes.with_label_values(&[outcome]).inc();
    }

    /// Replace the instance gauges with counts from a fresh snapshot
    pub fn set_instance_counts(&self, instances: &[Instance]) {
        let mut counts: BTreeMap<(&str, &'static str), i64> = BTreeMap::new();
        for instance in instances {
            let health = match instance.health {
                Health::Healthy => "healthy",
                Health::Unhealthy => "unhealthy",
                Health::Pending => "pending",
            };
            *counts.entry((instance.version.as_str(), health)).or_default() += 1;
        }

        // Versions that disappeared must not keep their last value
        self.instances.reset();
        for ((version, health), count) in counts {
            self.instances
                .with_label_values(&[version, health])
                .set(count);
        }
    }

    /// Publish the routing state as one gauge per known version
    pub fn set_traffic_weights(&self, versions: &[String], routing: &RoutingState) {
        for version in versions {
            self.traffic_weight
                .with_label_values(&[version.as_str()])
                .set(i64::from(routing.weight_of(version)));
        }
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
