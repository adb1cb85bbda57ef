//! Deployment strategy controller
//!
//! Drives blue-green, progressive rollout and canary releases of one
//! application against a Kubernetes cluster, with a chaos kill switch
//! and a small JSON control API.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod server;
