//! Host Fault Agent Library
//!
//! Reversible fault injection on a Linux host: CPU, memory and IO stress,
//! disk and memory fill, CPU frequency limits, clock shifts, process stops,
//! shutdown and network faults. Each capability is an action with a
//! prepare/start/status/stop lifecycle served over HTTP.

pub mod action;
pub mod agent;
pub mod config;
pub mod discovery;
pub mod exec;
pub mod fill;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod server;
pub mod stress;
pub mod sysfs;
