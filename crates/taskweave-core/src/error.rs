use uuid::Uuid;

/// Top-level error type for Taskweave.
///
/// Each variant corresponds to one class of failure the engine has to tell
/// apart: persistence problems, unreadable snapshots, exhausted agents,
/// engine-internal faults, and the failure shapes the fallback classifier
/// recognises.
#[derive(Debug, thiserror::Error)]
pub enum TaskweaveError {
    /// The persistence medium is unavailable or rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A persisted snapshot could not be parsed. Never repaired automatically.
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord {
        /// Identifier of the unreadable record.
        id: String,
        /// Parser message.
        reason: String,
    },

    /// No record with this id exists in any location.
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// An archived record was the target of a mutation.
    #[error("Record {0} is archived and read-only")]
    ReadOnly(Uuid),

    /// An agent adapter exhausted all of its attempts.
    #[error("Agent '{agent}' failed after {attempts} attempt(s): {source}")]
    AgentFailed {
        /// Name the agent was registered under.
        agent: String,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<TaskweaveError>,
    },

    /// An unexpected internal failure of the workflow engine.
    #[error("Engine error: {0}")]
    Engine(String),

    /// A capability needed by an agent is not registered.
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// A credential needed by an agent is not configured.
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    /// A transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// An operation exceeded its wall-clock budget.
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// Configured budget in milliseconds.
        timeout_ms: u64,
    },

    /// A capability was invoked and reported an error.
    #[error("Capability '{name}' failed: {message}")]
    Capability {
        /// Capability name.
        name: String,
        /// Error payload returned by the capability.
        message: String,
    },

    /// A domain agent reported a failure of its own.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`TaskweaveError`].
pub type TaskweaveResult<T> = Result<T, TaskweaveError>;

impl TaskweaveError {
    /// Build a [`TaskweaveError::Timeout`] from a [`std::time::Duration`].
    pub fn timeout(operation: impl Into<String>, budget: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The innermost error, looking through [`TaskweaveError::AgentFailed`] wrappers.
    pub fn root(&self) -> &TaskweaveError {
        match self {
            TaskweaveError::AgentFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error was produced by an adapter giving up on an agent.
    pub fn is_agent_failure(&self) -> bool {
        matches!(self, TaskweaveError::AgentFailed { .. })
    }
}
