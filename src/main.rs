use cutover::cluster::{ClusterAdapter, KubeCluster, TimeoutAdapter};
use cutover::config::ControllerConfig;
use cutover::controller::{
    ChaosInjector, PodRegistry, StrategyEngine, SystemClock, TrafficRouter,
};
use cutover::server::{
    build_router, create_metrics, serve, shutdown_channel, wait_for_signal, AppState,
    ReadinessState,
};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// How long in-flight tasks get to finish after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting cutover deployment strategy controller");

    let config = match ControllerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        namespace = %config.namespace,
        app = %config.app,
        route = %config.route_name,
        versions = %config.versions.join(","),
        default_version = %config.default_version,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let cluster: Arc<dyn ClusterAdapter> = Arc::new(TimeoutAdapter::new(
        KubeCluster::new(client, config.cluster_config()),
        config.cluster_timeout,
    ));
    let clock = Arc::new(SystemClock);

    let registry = Arc::new(PodRegistry::new(
        cluster.clone(),
        clock.clone(),
        Some(metrics.clone()),
    ));
    let router = Arc::new(TrafficRouter::new(
        cluster.clone(),
        registry.clone(),
        config.versions.clone(),
        Some(metrics.clone()),
    ));
    let engine = Arc::new(StrategyEngine::new(
        cluster.clone(),
        registry.clone(),
        router.clone(),
        clock,
        config.engine_settings(),
        Some(metrics.clone()),
    ));
    let chaos = Arc::new(ChaosInjector::new(cluster, Some(metrics.clone())));

    // Registry ticker marks readiness after its first successful refresh
    let registry_handle = tokio::spawn(registry.clone().run(
        config.refresh_interval,
        readiness.clone(),
        shutdown_signal.clone(),
    ));
    // Keeps the cached routing served by /api/status current
    let routing_handle = tokio::spawn(
        router
            .clone()
            .run(config.refresh_interval, shutdown_signal.clone()),
    );

    let state = AppState {
        engine,
        registry,
        router,
        chaos,
    };
    let app = build_router(state, readiness.clone(), metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    let server_signal = shutdown_signal.clone();
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, app, server_signal).await {
            warn!(error = %e, "HTTP server failed");
        }
    });

    tokio::select! {
        _ = &mut server_handle => {
            warn!("HTTP server exited unexpectedly");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Cannot listen for termination signals, shutting down"),
            }
            // Stop receiving traffic before draining
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();

    info!("Stopping components...");
    if tokio::time::timeout(SHUTDOWN_GRACE, registry_handle)
        .await
        .is_err()
    {
        warn!("Registry loop did not stop within the grace period");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, routing_handle)
        .await
        .is_err()
    {
        warn!("Routing loop did not stop within the grace period");
    }
    if !server_handle.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut server_handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not drain within the grace period");
        server_handle.abort();
    }

    info!("Controller shut down gracefully");
    Ok(())
}
