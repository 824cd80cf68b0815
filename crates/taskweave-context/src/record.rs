use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use taskweave_core::FailureReason;
use uuid::Uuid;

/// Phase a freshly created record starts in.
pub const INITIAL_PHASE: &str = "initialized";
/// Phase set by administrative cancellation.
pub const CANCELLED_PHASE: &str = "cancelled";

// A thousand years; keeps the chrono duration in range.
const MAX_TTL_HOURS: i64 = 24 * 365 * 1000;

/// Scheduling priority of a record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Lifecycle status of one agent within a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

/// One call an agent made to an external capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityUsage {
    pub capability: String,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-agent sub-record. Created on first touch and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Attempts made in the most recent execution.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub capability_usage: Vec<CapabilityUsage>,
}

/// Lifecycle point at which a hook fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeAgent,
    AfterAgent,
    AgentError,
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookKind::BeforeAgent => write!(f, "before_agent"),
            HookKind::AfterAgent => write!(f, "after_agent"),
            HookKind::AgentError => write!(f, "agent_error"),
        }
    }
}

/// Append-only log entry for a lifecycle hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub agent: String,
    pub kind: HookKind,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only log entry for one handled failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub agent: String,
    pub reason: FailureReason,
    pub fallback_target: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// Append-only log entry for a command an agent executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecution {
    pub agent: String,
    pub command: String,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Creation-time attributes of a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default)]
    pub priority: Priority,
    /// `None` or `Some(0)` disables expiry.
    #[serde(default)]
    pub ttl_hours: Option<u64>,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl RecordMetadata {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.ttl_hours = Some(hours);
        self
    }

    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Status derived from a record's contents, used by search filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Completed,
    Failed,
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(RecordStatus::Active),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// The versioned unit of shared state a workflow run operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub task: String,
    pub phase: String,
    pub priority: Priority,
    pub ttl_hours: Option<u64>,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub agents_completed: Vec<String>,
    /// Last agent started by a sequential or conditional run.
    pub current_agent: Option<String>,
    /// Every agent currently executing, including parallel branches.
    #[serde(default)]
    pub running_agents: BTreeSet<String>,
    pub shared_artifacts: HashMap<String, serde_json::Value>,
    pub agent_states: HashMap<String, AgentState>,
    pub hook_events: Vec<HookEvent>,
    pub fallback_log: Vec<FallbackRecord>,
    #[serde(default)]
    pub command_log: Vec<CommandExecution>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub version: u64,
}

impl ContextRecord {
    pub fn new(task: impl Into<String>, metadata: RecordMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            archived_at: None,
            task: task.into(),
            phase: INITIAL_PHASE.to_string(),
            priority: metadata.priority,
            ttl_hours: metadata.ttl_hours,
            workflow_type: metadata.workflow_type,
            tags: metadata.tags,
            agents_completed: Vec::new(),
            current_agent: None,
            running_agents: BTreeSet::new(),
            shared_artifacts: HashMap::new(),
            agent_states: HashMap::new(),
            hook_events: Vec::new(),
            fallback_log: Vec::new(),
            command_log: Vec::new(),
            metadata: metadata.extra,
            version: 1,
        }
    }

    /// Get or create the state for an agent.
    pub fn agent_state_mut(&mut self, agent: &str) -> &mut AgentState {
        self.agent_states.entry(agent.to_string()).or_default()
    }

    pub fn agent_state(&self, agent: &str) -> Option<&AgentState> {
        self.agent_states.get(agent)
    }

    /// Mark an agent in progress. A previously completed agent leaves the
    /// completed list until it completes again.
    pub fn mark_agent_started(&mut self, agent: &str) {
        let now = Utc::now();
        let state = self.agent_state_mut(agent);
        state.status = AgentStatus::InProgress;
        state.started_at = Some(now);
        state.completed_at = None;
        state.attempts = 0;
        self.agents_completed.retain(|a| a != agent);
        self.current_agent = Some(agent.to_string());
        self.running_agents.insert(agent.to_string());
    }

    /// Record a failed attempt that will be retried.
    pub fn mark_agent_retrying(&mut self, agent: &str, error: impl Into<String>) {
        let state = self.agent_state_mut(agent);
        state.status = AgentStatus::Retrying;
        state.last_error = Some(error.into());
        state.retry_count += 1;
    }

    pub fn mark_agent_completed(&mut self, agent: &str) {
        let state = self.agent_state_mut(agent);
        state.status = AgentStatus::Completed;
        state.completed_at = Some(Utc::now());
        if !self.agents_completed.iter().any(|a| a == agent) {
            self.agents_completed.push(agent.to_string());
        }
        self.release_agent(agent);
    }

    pub fn mark_agent_failed(&mut self, agent: &str, error: impl Into<String>) {
        let state = self.agent_state_mut(agent);
        state.status = AgentStatus::Failed;
        state.last_error = Some(error.into());
        self.agents_completed.retain(|a| a != agent);
        self.release_agent(agent);
    }

    fn release_agent(&mut self, agent: &str) {
        self.running_agents.remove(agent);
        if self.current_agent.as_deref() == Some(agent) {
            self.current_agent = None;
        }
    }

    pub fn set_artifact(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.shared_artifacts.insert(key.into(), value);
    }

    pub fn artifact(&self, key: &str) -> Option<&serde_json::Value> {
        self.shared_artifacts.get(key)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase == CANCELLED_PHASE
    }

    pub fn has_failed_agent(&self) -> bool {
        self.agent_states
            .values()
            .any(|s| s.status == AgentStatus::Failed)
    }

    /// Whether the record matches a derived status.
    pub fn has_status(&self, status: RecordStatus) -> bool {
        match status {
            RecordStatus::Completed => self.completed_at.is_some(),
            RecordStatus::Active => self.completed_at.is_none(),
            RecordStatus::Failed => self.has_failed_agent(),
        }
    }

    /// `now - created_at > ttl_hours`; a TTL of zero or none never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_hours {
            Some(hours) if hours > 0 => {
                let hours = i64::try_from(hours).unwrap_or(MAX_TTL_HOURS).min(MAX_TTL_HOURS);
                let ttl = Duration::hours(hours);
                now.signed_duration_since(self.created_at) > ttl
            }
            _ => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Whether a record has outlived its TTL.
pub fn is_expired(record: &ContextRecord) -> bool {
    record.is_expired()
}
