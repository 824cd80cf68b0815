//! Core types and error definitions for Taskweave.
//!
//! This crate provides the foundational types shared across all Taskweave
//! crates: the error taxonomy, the opaque external-capability interface, the
//! closed set of failure reasons, and the telemetry sink the workflow engine
//! reports through.
//!
//! # Main types
//!
//! - [`TaskweaveError`]: Unified error enum for all Taskweave subsystems.
//! - [`TaskweaveResult`]: Convenience alias for `Result<T, TaskweaveError>`.
//! - [`Capability`] / [`CapabilityRegistry`]: `invoke_capability(name, args)` contract.
//! - [`FailureReason`]: Classification buckets for the fallback policy.
//! - [`TelemetrySink`]: Injected receiver for per-run engine events.

/// Opaque external capabilities and their registry.
pub mod capability;
/// Error taxonomy.
pub mod error;
/// Failure classification reasons.
pub mod failure;
/// Per-run telemetry sinks.
pub mod telemetry;

pub use capability::{Capability, CapabilityRegistry, CapabilityResponse, CapabilityStatus};
pub use error::{TaskweaveError, TaskweaveResult};
pub use failure::FailureReason;
pub use telemetry::{
    MemorySink, RunTelemetry, TelemetryEntry, TelemetryEvent, TelemetrySink, TracingSink,
};
