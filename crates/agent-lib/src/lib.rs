//! Agent library for node-level cpuset isolation
//!
//! This crate provides the core functionality for:
//! - Caching the cluster state that drives isolation (states informer)
//! - Computing the node cpuset rule and per-container cpusets
//! - Applying cgroup updates through a serialized executor
//! - Health checks and observability

pub mod cgroup;
pub mod cpu_list;
pub mod executor;
pub mod health;
pub mod hooks;
pub mod models;
pub mod observability;
pub mod statesinformer;

pub use cpu_list::{CpuSet, CpuSetParseError};
pub use executor::{ExecutorError, ExecutorWorker, ResourceUpdateExecutor, UpdateOutcome};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
