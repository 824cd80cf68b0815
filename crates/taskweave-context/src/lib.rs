//! Versioned context records and their persistence.
//!
//! A [`ContextRecord`] is the unit of shared state every agent of a workflow
//! run reads and writes. Records live in exactly one of two locations
//! (active or archived) inside a [`ContextStore`]; [`FileContextStore`] keeps
//! one JSON snapshot per record on disk.
//!
//! # Main types
//!
//! - [`ContextRecord`]: Task, artifacts, per-agent state and event logs.
//! - [`ContextStore`]: Narrow get/save/archive/list interface.
//! - [`FileContextStore`]: Directory-of-snapshots backend.
//! - [`ContextHandle`]: Mutex-guarded in-memory record shared by a run.
//! - [`RecordLocks`]: One save lock per record id.

/// Search criteria over persisted records.
pub mod filter;
/// The record type and its sub-records.
pub mod record;
/// Shared in-memory handle and per-id locks.
pub mod shared;
/// Store trait and file backend.
pub mod store;

pub use filter::RecordFilter;
pub use record::{
    is_expired, AgentState, AgentStatus, CapabilityUsage, CommandExecution, ContextRecord,
    FallbackRecord, HookEvent, HookKind, Priority, RecordMetadata, RecordStatus, CANCELLED_PHASE,
    INITIAL_PHASE,
};
pub use shared::{ContextHandle, RecordLocks};
pub use store::{CleanupReport, ContextStore, FileContextStore, RecordLocation, StoreStats};
