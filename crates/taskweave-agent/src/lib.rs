//! Agent execution for Taskweave.
//!
//! An [`Agent`] is an opaque unit of domain work. The [`AgentAdapter`] wraps
//! every execution in the same lifecycle: state bookkeeping, lifecycle hooks,
//! a wall-clock timeout and bounded retries with exponential backoff. The
//! [`FallbackPolicy`] decides, after an adapter gives up, whether the engine
//! should retry the same path or switch to an alternate one.
//!
//! # Main types
//!
//! - [`Agent`] / [`AgentContext`]: The agent contract and what it sees.
//! - [`AgentAdapter`]: Retrying, timing-out executor.
//! - [`FallbackPolicy`]: Failure classification and fallback bookkeeping.
//! - [`HookRunner`]: Lifecycle hooks through a named capability.

/// Agent trait and per-execution context.
pub mod agent;
/// The retrying adapter.
pub mod adapter;
/// Adapter configuration and backoff.
pub mod config;
/// Failure classification and fallback policy.
pub mod fallback;
/// Lifecycle hooks.
pub mod hooks;

pub use adapter::AgentAdapter;
pub use agent::{Agent, AgentContext};
pub use config::{compute_backoff, AdapterConfig};
pub use fallback::{
    classify, classify_message, FallbackAction, FallbackConfig, FallbackDecision, FallbackPolicy,
    FallbackStats, PortableContext,
};
pub use hooks::HookRunner;
