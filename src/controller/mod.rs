//! Deployment control: registry, router, chaos and the strategy engine
//!
//! Everything here talks to the cluster only through
//! [`ClusterAdapter`](crate::cluster::ClusterAdapter).

pub mod chaos;
pub mod clock;
pub mod engine;
mod error;
pub mod registry;
pub mod router;
pub mod strategies;

pub use chaos::ChaosInjector;
pub use clock::{Clock, SystemClock};
pub use engine::{DeployRequest, EngineSettings, RunSummary, StrategyEngine, StrategyRun};
pub use error::ControllerError;
pub use registry::{PodRegistry, RegistrySnapshot, VersionCount};
pub use router::{RoutingView, TrafficRouter};
pub use strategies::{Strategy, StrategyKind};
