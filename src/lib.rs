#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod reporter;
pub mod telemetry;
