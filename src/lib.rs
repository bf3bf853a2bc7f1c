//! flowshift: traffic routers for progressive delivery on Kubernetes

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod router;
pub mod server;
