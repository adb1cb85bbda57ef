//! Controller configuration from `CUTOVER_*` environment variables
//!
//! Every variable is optional. Values that are present but malformed fail
//! startup instead of silently falling back to a default.

use crate::cluster::{KubeClusterConfig, DEFAULT_CLUSTER_TIMEOUT};
use crate::controller::EngineSettings;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub namespace: String,
    pub app: String,
    pub route_name: String,
    pub service_port: i32,
    pub versions: Vec<String>,
    pub default_version: String,
    pub baseline_replicas: i32,
    pub refresh_interval: Duration,
    pub cluster_timeout: Duration,
    pub http_port: u16,
    pub canary_initial_weight: u32,
    pub canary_increment: u32,
    pub rollout_step_size: i32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            app: "web".to_string(),
            route_name: "web-route".to_string(),
            service_port: 80,
            versions: vec!["blue".to_string(), "green".to_string()],
            default_version: "blue".to_string(),
            baseline_replicas: 3,
            refresh_interval: Duration::from_secs(2),
            cluster_timeout: DEFAULT_CLUSTER_TIMEOUT,
            http_port: 8080,
            canary_initial_weight: 10,
            canary_increment: 25,
            rollout_step_size: 1,
        }
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
            var,
            value,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let ms: u64 = parsed(lookup, var, default.as_millis() as u64)?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

impl ControllerConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let versions = match lookup("CUTOVER_VERSIONS") {
            Some(raw) => raw
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
            None => defaults.versions,
        };

        let config = Self {
            namespace: lookup("CUTOVER_NAMESPACE").unwrap_or(defaults.namespace),
            app: lookup("CUTOVER_APP").unwrap_or(defaults.app),
            route_name: lookup("CUTOVER_ROUTE_NAME").unwrap_or(defaults.route_name),
            service_port: parsed(&lookup, "CUTOVER_SERVICE_PORT", defaults.service_port)?,
            versions,
            default_version: lookup("CUTOVER_DEFAULT_VERSION").unwrap_or(defaults.default_version),
            baseline_replicas: parsed(
                &lookup,
                "CUTOVER_BASELINE_REPLICAS",
                defaults.baseline_replicas,
            )?,
            refresh_interval: millis(
                &lookup,
                "CUTOVER_REFRESH_INTERVAL_MS",
                defaults.refresh_interval,
            )?,
            cluster_timeout: millis(
                &lookup,
                "CUTOVER_CLUSTER_TIMEOUT_MS",
                defaults.cluster_timeout,
            )?,
            http_port: parsed(&lookup, "CUTOVER_HTTP_PORT", defaults.http_port)?,
            canary_initial_weight: parsed(
                &lookup,
                "CUTOVER_CANARY_INITIAL_WEIGHT",
                defaults.canary_initial_weight,
            )?,
            canary_increment: parsed(
                &lookup,
                "CUTOVER_CANARY_INCREMENT",
                defaults.canary_increment,
            )?,
            rollout_step_size: parsed(
                &lookup,
                "CUTOVER_ROLLOUT_STEP_SIZE",
                defaults.rollout_step_size,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |var: &'static str, reason: String| Err(ConfigError::Invalid { var, reason });

        let unique: BTreeSet<&String> = self.versions.iter().collect();
        if self.versions.len() < 2 || unique.len() != self.versions.len() {
            return invalid(
                "CUTOVER_VERSIONS",
                format!("need at least two distinct versions, got {:?}", self.versions),
            );
        }
        if !self.versions.contains(&self.default_version) {
            return invalid(
                "CUTOVER_DEFAULT_VERSION",
                format!(
                    "{} is not one of {}",
                    self.default_version,
                    self.versions.join(",")
                ),
            );
        }
        if self.baseline_replicas < 0 {
            return invalid("CUTOVER_BASELINE_REPLICAS", "must not be negative".to_string());
        }
        if !(1..=100).contains(&self.canary_initial_weight) {
            return invalid(
                "CUTOVER_CANARY_INITIAL_WEIGHT",
                "must be between 1 and 100".to_string(),
            );
        }
        if !(1..=100).contains(&self.canary_increment) {
            return invalid(
                "CUTOVER_CANARY_INCREMENT",
                "must be between 1 and 100".to_string(),
            );
        }
        if self.rollout_step_size < 1 {
            return invalid("CUTOVER_ROLLOUT_STEP_SIZE", "must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn cluster_config(&self) -> KubeClusterConfig {
        KubeClusterConfig {
            namespace: self.namespace.clone(),
            app: self.app.clone(),
            route_name: self.route_name.clone(),
            service_port: self.service_port,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            versions: self.versions.clone(),
            default_version: self.default_version.clone(),
            baseline_replicas: self.baseline_replicas,
            canary_initial_weight: self.canary_initial_weight,
            canary_increment: self.canary_increment,
            rollout_step_size: self.rollout_step_size,
        }
    }
}
