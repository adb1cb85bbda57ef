//! HTTP tests for the Control API against an in-memory cluster

use super::*;
use crate::cluster::mock::MockCluster;
use crate::cluster::{ClusterAdapter, ClusterError, RoutingState};
use crate::controller::{EngineSettings, SystemClock};
use crate::server::metrics::create_metrics;
use crate::server::shutdown::shutdown_channel;
use serde_json::Value;
use std::time::Duration;

struct TestServer {
    base: String,
    cluster: MockCluster,
    registry: Arc<PodRegistry>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(cluster: MockCluster) -> Self {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(cluster.clone());
        let metrics = create_metrics().unwrap();
        let versions = vec!["blue".to_string(), "green".to_string()];
        let registry = Arc::new(PodRegistry::new(
            adapter.clone(),
            Arc::new(SystemClock),
            Some(metrics.clone()),
        ));
        registry.refresh().await.unwrap();
        let router = Arc::new(TrafficRouter::new(
            adapter.clone(),
            registry.clone(),
            versions.clone(),
            Some(metrics.clone()),
        ));
        // Stands in for the first tick of the routing refresh loop
        let _ = router.current_routing().await;
        let engine = Arc::new(StrategyEngine::new(
            adapter.clone(),
            registry.clone(),
            router.clone(),
            Arc::new(SystemClock),
            EngineSettings {
                versions,
                default_version: "blue".to_string(),
                baseline_replicas: 3,
                canary_initial_weight: 10,
                canary_increment: 30,
                rollout_step_size: 1,
            },
            Some(metrics.clone()),
        ));
        let chaos = Arc::new(ChaosInjector::new(adapter, Some(metrics.clone())));

        let state = AppState {
            engine,
            registry: registry.clone(),
            router,
            chaos,
        };
        let readiness = ReadinessState::new();
        readiness.set_ready();
        let app = build_router(state, readiness, metrics);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (controller, signal) = shutdown_channel();
        tokio::spawn(async move {
            let _controller = controller;
            serve(listener, app, signal).await
        });

        Self {
            base,
            cluster,
            registry,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap()
    }

    async fn post_empty(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_status_reports_snapshot_routing_and_no_run() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;

    let response = server.get("/api/status").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["instances"].as_array().unwrap().len(), 6);
    assert_eq!(body["versions"]["blue"]["healthy"], 3);
    assert_eq!(body["versions"]["green"]["total"], 3);
    assert_eq!(body["routing"]["mode"], "exclusive");
    assert_eq!(body["routing"]["activeVersion"], "blue");
    assert!(body["activeStrategy"].is_null());
    assert!(body["refreshedAt"].is_string());
}

#[tokio::test]
async fn test_status_survives_unreadable_routing() {
    let server = TestServer::start(MockCluster::builder().group("blue", 2).build()).await;

    let body: Value = server.get("/api/status").await.json().await.unwrap();

    assert!(body["routing"].is_null());
    assert!(body["routingError"].as_str().unwrap().contains("web-route"));
    assert_eq!(body["versions"]["green"]["total"], 0);
}

#[tokio::test]
async fn test_status_does_not_wait_on_slow_cluster() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    server.cluster.set_latency(Duration::from_secs(3));

    let started = std::time::Instant::now();
    let response = server.get("/api/status").await;

    assert_eq!(response.status(), 200);
    assert!(started.elapsed() < Duration::from_secs(1));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["routing"]["activeVersion"], "blue");
    assert!(body.get("routingError").is_none());
}

#[tokio::test]
async fn test_canary_scenario_over_http() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;

    let response = server
        .post("/api/deploy", json!({"strategy": "canary", "target": "green"}))
        .await;
    assert_eq!(response.status(), 200);
    let run: Value = response.json().await.unwrap();
    assert_eq!(run["kind"], "canary");
    assert_eq!(run["phase"], "weighted");
    assert_eq!(run["weight"], 10);

    let status: Value = server.get("/api/status").await.json().await.unwrap();
    assert_eq!(status["routing"]["mode"], "weighted");
    assert_eq!(status["routing"]["weights"]["blue"], 90);
    assert_eq!(status["activeStrategy"]["id"], run["id"]);

    let mut last = Value::Null;
    for _ in 0..3 {
        let response = server.post_empty("/api/advance").await;
        assert_eq!(response.status(), 200);
        last = response.json().await.unwrap();
    }
    assert_eq!(last["phase"], "promoted");
    assert_eq!(last["weight"], 100);

    let status: Value = server.get("/api/status").await.json().await.unwrap();
    assert_eq!(status["routing"]["weights"]["green"], 100);
    assert!(status["activeStrategy"].is_null());
    assert_eq!(status["lastRun"]["phase"], "promoted");

    let response = server.post_empty("/api/advance").await;
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn test_blue_green_without_capacity_is_422() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    server.cluster.mark_unhealthy("green");
    server.registry.refresh().await.unwrap();

    let response = server
        .post("/api/deploy", json!({"strategy": "blue-green", "target": "green"}))
        .await;

    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "InsufficientCapacity");
    assert!(body["reason"].as_str().unwrap().contains("green"));
}

#[tokio::test]
async fn test_malformed_deploy_is_400() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;

    let response = server
        .post("/api/deploy", json!({"strategy": "recreate", "target": "green"}))
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "InvalidRequest");

    let response = server
        .post("/api/deploy", json!({"strategy": "canary", "target": "purple"}))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_abort_of_rollout_is_409() {
    let cluster = MockCluster::builder()
        .group("blue", 3)
        .group("green", 0)
        .routing(RoutingState::exclusive("blue"))
        .build();
    let server = TestServer::start(cluster).await;
    let response = server
        .post("/api/deploy", json!({"strategy": "rollout", "target": "green", "stepSize": 2}))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(server.cluster.desired("green"), Some(2));

    let response = server.post_empty("/api/abort").await;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "NotAbortable");
}

#[tokio::test]
async fn test_cluster_unreachable_is_503() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    server
        .cluster
        .fail_next(ClusterError::ClusterUnreachable("connection refused".to_string()));

    let response = server
        .post("/api/deploy", json!({"strategy": "blue-green", "target": "green"}))
        .await;

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "ClusterUnreachable");
}

#[tokio::test]
async fn test_kill_instance_is_accepted_and_replaced() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    let victim = server.cluster.instance_names("green")[0].clone();

    let response = server
        .post("/api/kill-instance", json!({"name": victim}))
        .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], victim.as_str());

    server.registry.refresh().await.unwrap();
    let status: Value = server.get("/api/status").await.json().await.unwrap();
    assert_eq!(status["versions"]["green"]["total"], 3);
    let names: Vec<&str> = status["instances"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["name"].as_str())
        .collect();
    assert!(!names.contains(&victim.as_str()));

    // Unknown names are still acknowledged
    let response = server
        .post("/api/kill-instance", json!({"name": "web-green-99999"}))
        .await;
    assert_eq!(response.status(), 202);
}

#[tokio::test]
async fn test_reset_returns_baseline_status() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    server
        .post("/api/deploy", json!({"strategy": "canary", "target": "green"}))
        .await;

    let response = server.post_empty("/api/reset").await;
    assert_eq!(response.status(), 200);
    let status: Value = response.json().await.unwrap();

    assert_eq!(status["routing"]["mode"], "exclusive");
    assert_eq!(status["routing"]["activeVersion"], "blue");
    assert!(status["activeStrategy"].is_null());
    assert_eq!(server.cluster.desired("blue"), Some(3));
    assert_eq!(server.cluster.desired("green"), Some(3));
}

#[tokio::test]
async fn test_metrics_count_strategy_steps() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    server
        .post("/api/deploy", json!({"strategy": "blue-green", "target": "green"}))
        .await;

    let body = server.get("/metrics").await.text().await.unwrap();

    assert!(body.contains(r#"cutover_strategy_steps_total{outcome="ok",strategy="blue-green"} 1"#));
    assert!(body.contains(r#"cutover_traffic_weight_percent{version="green"} 100"#));
}

#[tokio::test]
async fn test_api_rejection_is_502_with_api_kind() {
    let server = TestServer::start(MockCluster::blue_green(3)).await;
    server
        .cluster
        .fail_next(ClusterError::Api("deployments.apps is forbidden".to_string()));

    let response = server
        .post("/api/deploy", json!({"strategy": "blue-green", "target": "green"}))
        .await;

    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Api");
    assert!(body["reason"].as_str().unwrap().contains("forbidden"));
}

#[test]
fn test_error_kinds_map_to_status_codes() {
    let cases = [
        (ControllerError::from(ClusterError::GroupNotFound("green".into())), 404),
        (ControllerError::from(ClusterError::RoutingConflict("rv".into())), 409),
        (ControllerError::from(ClusterError::Api("forbidden".into())), 502),
        (ControllerError::StepInProgress, 409),
        (ControllerError::NotAbortable("rollout"), 409),
        (ControllerError::InsufficientCapacity {
            version: "green".into(),
            healthy: 0,
            required: 3,
        }, 422),
        (ControllerError::from(ClusterError::ClusterUnreachable("timeout".into())), 503),
        (ControllerError::from(ClusterError::RoutingNotFound("web-route".into())), 404),
        (ControllerError::InvalidRequest("empty".into()), 400),
        (ControllerError::InvalidWeights("sum 90".into()), 422),
    ];
    for (err, code) in cases {
        assert_eq!(status_code(&err).as_u16(), code, "{:?}", err);
    }
}
