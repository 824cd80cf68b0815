//! Workflow engine and health monitoring for Taskweave.
//!
//! Runs lists of agents against a shared context record under one of three
//! strategies, routes exhausted agents through the fallback policy, and
//! gates the choice of execution path on pre-flight health checks.
//!
//! # Main types
//!
//! - [`WorkflowEngine`]: Sequential, parallel and conditional runs, plus cancellation.
//! - [`WorkflowStep`]: A named agent with an optional condition and fallback agent.
//! - [`WorkflowResult`]: Terminal outcome of a run.
//! - [`HealthMonitor`]: Ordered readiness checks producing a [`HealthReport`].

/// The workflow engine.
pub mod engine;
/// Readiness checks and the health monitor.
pub mod health;
/// Run, step and result types.
pub mod types;

pub use engine::WorkflowEngine;
pub use health::{
    CapabilityCheck, CredentialCheck, FilesystemLayoutCheck, HealthCheck, HealthCheckResult,
    HealthConfig, HealthMonitor, HealthReport, HealthStatus, ResourceHeadroomCheck,
    StorageWritableCheck,
};
pub use types::{
    Condition, EngineConfig, RunStatus, StepFailure, Strategy, WorkflowResult, WorkflowStep,
};
