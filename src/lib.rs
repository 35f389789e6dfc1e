//! orfleet: per-room medical device fleet orchestrator
//!
//! Turns "which device simulators are assigned to operating room R" into
//! running workloads on a cluster, reachable over one realtime stream per
//! room, and keeps the shared ingress document in step as rooms are added.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod ingress;
pub mod manifest;
pub mod room;
pub mod server;
pub mod store;
