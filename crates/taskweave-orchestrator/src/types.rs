use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_agent::Agent;
use taskweave_context::ContextRecord;
use taskweave_core::TaskweaveResult;
use uuid::Uuid;

/// State of a workflow run against one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    /// Every step succeeded.
    Completed,
    /// A parallel batch where some steps succeeded and some failed.
    Partial,
    Failed,
    /// The record was cancelled before the run could start.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::NotStarted | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotStarted => write!(f, "not_started"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How the steps of a run are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// List order; the first failure stops the run.
    Sequential,
    /// All steps at once, bounded by `max_parallel`.
    Parallel,
    /// Like sequential, but steps whose condition is false are skipped.
    Conditional,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::Parallel => write!(f, "parallel"),
            Strategy::Conditional => write!(f, "conditional"),
        }
    }
}

/// Predicate deciding whether a conditional step runs.
pub type Condition = Arc<dyn Fn(&ContextRecord) -> TaskweaveResult<bool> + Send + Sync>;

/// One named step of a workflow.
#[derive(Clone)]
pub struct WorkflowStep {
    /// Name the agent's state and completion are recorded under.
    pub name: String,
    pub agent: Arc<dyn Agent>,
    /// Only consulted by [`Strategy::Conditional`].
    pub condition: Option<Condition>,
    /// Alternate path used when the fallback policy gives up on `agent`.
    pub fallback: Option<Arc<dyn Agent>>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            name: name.into(),
            agent,
            condition: None,
            fallback: None,
        }
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ContextRecord) -> TaskweaveResult<bool> + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_fallback(mut self, agent: Arc<dyn Agent>) -> Self {
        self.fallback = Some(agent);
        self
    }
}

impl std::fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("name", &self.name)
            .field("agent", &self.agent.name())
            .field("conditional", &self.condition.is_some())
            .field("fallback", &self.fallback.as_ref().map(|a| a.name().to_string()))
            .finish()
    }
}

/// The failing step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub agent: String,
    pub message: String,
}

/// Terminal result of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub record_id: Uuid,
    pub strategy: Strategy,
    pub status: RunStatus,
    /// Steps handed to an adapter, in list order.
    pub agents_run: Vec<String>,
    pub agents_completed: Vec<String>,
    pub agents_failed: Vec<String>,
    pub agents_skipped: Vec<String>,
    /// Payload returned by each completed step.
    pub outputs: HashMap<String, serde_json::Value>,
    /// The first failure, in list order.
    pub error: Option<StepFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowResult {
    pub(crate) fn new(run_id: Uuid, record_id: Uuid, strategy: Strategy) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            record_id,
            strategy,
            status: RunStatus::Running,
            agents_run: Vec::new(),
            agents_completed: Vec::new(),
            agents_failed: Vec::new(),
            agents_skipped: Vec::new(),
            outputs: HashMap::new(),
            error: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub(crate) fn record_failure(&mut self, agent: &str, message: String) {
        self.agents_failed.push(agent.to_string());
        if self.error.is_none() {
            self.error = Some(StepFailure {
                agent: agent.to_string(),
                message,
            });
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running parallel steps.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Move the record to the archive when a run completes.
    #[serde(default = "default_archive_on_completion")]
    pub archive_on_completion: bool,
    /// Fallback events per step after which a repeated-failure alert is logged.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: usize,
}

fn default_max_parallel() -> usize {
    4
}

fn default_archive_on_completion() -> bool {
    true
}

fn default_alert_threshold() -> usize {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            archive_on_completion: default_archive_on_completion(),
            alert_threshold: default_alert_threshold(),
        }
    }
}
