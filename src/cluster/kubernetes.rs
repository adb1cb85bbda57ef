//! Kubernetes implementation of the cluster adapter
//!
//! - Instances are Pods labelled `app=<app>,version=<tag>`
//! - Workload groups are Deployments named `<app>-<tag>`
//! - The routing object is a Gateway API HTTPRoute whose first rule's
//!   backendRefs point at per-version Services named `<app>-<tag>`

use super::{ClusterAdapter, ClusterError, Health, Instance, ObservedRouting, RoutingState};
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRouteRulesBackendRefs;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Annotation on the HTTPRoute recording the routing mode
pub const ROUTING_MODE_ANNOTATION: &str = "cutover.io/routing-mode";

/// Label carrying an instance's version tag
const VERSION_LABEL: &str = "version";

/// Names and coordinates of the objects this adapter manages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeClusterConfig {
    pub namespace: String,
    /// Value of the `app` label shared by every instance
    pub app: String,
    /// Name of the HTTPRoute that carries live traffic
    pub route_name: String,
    /// Port on the per-version Services
    pub service_port: i32,
}

impl KubeClusterConfig {
    fn group_name(&self, version: &str) -> String {
        format!("{}-{}", self.app, version)
    }

    fn version_from_backend<'a>(&self, backend: &'a str) -> Option<&'a str> {
        backend
            .strip_prefix(self.app.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|v| !v.is_empty())
    }

    fn selector(&self, version: Option<&str>) -> String {
        match version {
            Some(v) => format!("app={},{}={}", self.app, VERSION_LABEL, v),
            None => format!("app={}", self.app),
        }
    }
}

/// Cluster adapter backed by the Kubernetes API
pub struct KubeCluster {
    client: kube::Client,
    config: KubeClusterConfig,
}

impl KubeCluster {
    pub fn new(client: kube::Client, config: KubeClusterConfig) -> Self {
        Self { client, config }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn routes(&self) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: "gateway.networking.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "gateway.networking.k8s.io/v1".to_string(),
            kind: "HTTPRoute".to_string(),
            plural: "httproutes".to_string(),
        };
        Api::namespaced_with(self.client.clone(), &self.config.namespace, &ar)
    }
}

/// Map transport failures to `ClusterUnreachable`; API status codes are
/// handled by the caller before falling through to here.
fn classify(error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(err) => ClusterError::Api(format!("{} ({})", err.message, err.code)),
        other => ClusterError::ClusterUnreachable(other.to_string()),
    }
}

/// Derive health from a pod's Ready condition and phase
pub(crate) fn pod_health(pod: &Pod) -> Health {
    if pod.metadata.deletion_timestamp.is_some() {
        return Health::Unhealthy;
    }
    let status = match &pod.status {
        Some(status) => status,
        None => return Health::Pending,
    };
    let ready = status
        .conditions
        .as_ref()
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));

    match ready {
        Some(condition) if condition.status == "True" => Health::Healthy,
        Some(_) if status.phase.as_deref() == Some("Pending") => Health::Pending,
        Some(_) => Health::Unhealthy,
        None => match status.phase.as_deref() {
            Some("Failed") | Some("Succeeded") => Health::Unhealthy,
            _ => Health::Pending,
        },
    }
}

fn pod_to_instance(pod: &Pod) -> Option<Instance> {
    let version = pod.labels().get(VERSION_LABEL)?.clone();
    let lifecycle_phase = if pod.metadata.deletion_timestamp.is_some() {
        "Terminating".to_string()
    } else {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    };
    Some(Instance {
        name: pod.name_any(),
        version,
        health: pod_health(pod),
        lifecycle_phase,
    })
}

/// Build the backendRefs for a routing state
pub(crate) fn backend_refs(
    config: &KubeClusterConfig,
    state: &RoutingState,
) -> Vec<HTTPRouteRulesBackendRefs> {
    let weights: Vec<(String, i32)> = match state {
        RoutingState::Exclusive { active_version } => vec![(active_version.clone(), 100)],
        RoutingState::Weighted { weights } => weights
            .iter()
            .map(|(v, w)| (v.clone(), *w as i32))
            .collect(),
    };

    weights
        .into_iter()
        .map(|(version, weight)| HTTPRouteRulesBackendRefs {
            name: config.group_name(&version),
            port: Some(config.service_port),
            weight: Some(weight),
            kind: Some("Service".to_string()),
            group: Some("".to_string()),
            namespace: None,
            filters: None,
        })
        .collect()
}

/// Scale relative backend weights to percentages summing to 100
///
/// Gateway API weights are proportional (an omitted weight counts as 1),
/// so `3:1` means 75/25. Rounding leftovers go to the largest remainders,
/// ties broken by version order. Returns None when every weight is zero.
fn to_percentages(weights: &BTreeMap<String, u32>) -> Option<BTreeMap<String, u32>> {
    let total: u64 = weights.values().map(|w| u64::from(*w)).sum();
    if total == 0 {
        return None;
    }

    let mut percentages = BTreeMap::new();
    let mut remainders = Vec::with_capacity(weights.len());
    let mut assigned = 0u64;
    for (version, weight) in weights {
        let scaled = u64::from(*weight) * 100;
        let share = scaled / total;
        assigned += share;
        remainders.push((scaled % total, version));
        percentages.insert(version.clone(), share as u32);
    }

    remainders.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    for (_, version) in remainders.into_iter().take((100 - assigned) as usize) {
        if let Some(share) = percentages.get_mut(version) {
            *share += 1;
        }
    }
    Some(percentages)
}

/// Reconstruct a routing state from the HTTPRoute's mode annotation and backendRefs
pub(crate) fn routing_from_route(
    config: &KubeClusterConfig,
    mode: Option<&str>,
    refs: &[HTTPRouteRulesBackendRefs],
) -> Result<RoutingState, ClusterError> {
    let mut weights = BTreeMap::new();
    for backend in refs {
        let Some(version) = config.version_from_backend(&backend.name) else {
            debug!(backend = %backend.name, "Ignoring backend that does not belong to this app");
            continue;
        };
        let weight = backend.weight.unwrap_or(1).max(0) as u32;
        weights.insert(version.to_string(), weight);
    }

    let live: Vec<&String> = weights
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(v, _)| v)
        .collect();

    let exclusive = match mode {
        Some("exclusive") => true,
        Some("weighted") => false,
        // No annotation: a single live backend is exclusive
        _ => live.len() == 1,
    };

    if exclusive {
        let active = live.first().ok_or_else(|| {
            ClusterError::Api(format!(
                "route {} has no backend with weight",
                config.route_name
            ))
        })?;
        return Ok(RoutingState::exclusive(active.as_str()));
    }

    let invalid = |reason: String| {
        ClusterError::Api(format!(
            "route {} holds invalid weights: {}",
            config.route_name, reason
        ))
    };
    let percentages =
        to_percentages(&weights).ok_or_else(|| invalid("every backend weight is zero".to_string()))?;
    RoutingState::weighted(percentages).map_err(|e| invalid(e.to_string()))
}

#[async_trait]
impl ClusterAdapter for KubeCluster {
    async fn list_instances(&self, version: Option<&str>) -> Result<Vec<Instance>, ClusterError> {
        let params = ListParams::default().labels(&self.config.selector(version));
        let pods = self.pods().list(&params).await.map_err(classify)?;
        Ok(pods.items.iter().filter_map(pod_to_instance).collect())
    }

    async fn group_replicas(&self, version: &str) -> Result<i32, ClusterError> {
        let name = self.config.group_name(version);
        match self.deployments().get(&name).await {
            Ok(deployment) => Ok(deployment.spec.and_then(|s| s.replicas).unwrap_or(1)),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::GroupNotFound(version.to_string()))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn set_group_replicas(&self, version: &str, replicas: i32) -> Result<(), ClusterError> {
        let current = self.group_replicas(version).await?;
        if current == replicas {
            debug!(version, replicas, "Workload group already at desired replicas");
            return Ok(());
        }

        let name = self.config.group_name(version);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        match self
            .deployments()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(version, from = current, to = replicas, "Scaled workload group");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::GroupNotFound(version.to_string()))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn routing(&self) -> Result<ObservedRouting, ClusterError> {
        let route = match self.routes().get(&self.config.route_name).await {
            Ok(route) => route,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(ClusterError::RoutingNotFound(self.config.route_name.clone()))
            }
            Err(e) => return Err(classify(e)),
        };

        let refs_json = route
            .data
            .pointer("/spec/rules/0/backendRefs")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        let refs: Vec<HTTPRouteRulesBackendRefs> = serde_json::from_value(refs_json)
            .map_err(|e| ClusterError::Api(format!("malformed backendRefs: {}", e)))?;

        let mode = route.annotations().get(ROUTING_MODE_ANNOTATION).cloned();
        let state = routing_from_route(&self.config, mode.as_deref(), &refs)?;

        Ok(ObservedRouting {
            state,
            revision: route.resource_version(),
        })
    }

    async fn set_routing(
        &self,
        state: &RoutingState,
        expected_revision: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mode = match state {
            RoutingState::Exclusive { .. } => "exclusive",
            RoutingState::Weighted { .. } => "weighted",
        };
        let refs = backend_refs(&self.config, state);

        let mut metadata = serde_json::json!({
            "annotations": { ROUTING_MODE_ANNOTATION: mode }
        });
        if let Some(revision) = expected_revision {
            // The API server rejects the patch with 409 if the object moved on
            metadata["resourceVersion"] = serde_json::Value::String(revision.to_string());
        }
        let patch = serde_json::json!({
            "metadata": metadata,
            "spec": { "rules": [{ "backendRefs": refs }] }
        });

        match self
            .routes()
            .patch(
                &self.config.route_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(route = %self.config.route_name, mode, "Routing object updated");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                warn!(route = %self.config.route_name, "Routing object modified concurrently");
                Err(ClusterError::RoutingConflict(err.message))
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::RoutingNotFound(self.config.route_name.clone()))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(instance = name, "Instance deletion requested");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                info!(instance = name, "Instance already gone, nothing to delete");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }
}
