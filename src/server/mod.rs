//! HTTP surface of the controller
//!
//! One listener serves the Control API, the Kubernetes probes
//! (`/healthz`, `/readyz`) and Prometheus `/metrics`. Also provides
//! graceful shutdown handling for SIGTERM/SIGINT.

pub mod api;
mod health;
pub mod metrics;
pub mod shutdown;

pub use api::{build_router, serve, AppState, ControllerStatus};
pub use health::{probe_router, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
