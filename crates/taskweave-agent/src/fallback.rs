use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use taskweave_context::{ContextRecord, FallbackRecord};
use taskweave_core::{FailureReason, TaskweaveError};
use tracing::{info, warn};
use uuid::Uuid;

/// Settings for cross-path retry and fallback decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Same-path retries allowed for retryable reasons before falling back.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// When false every reason falls back immediately.
    #[serde(default = "default_true")]
    pub retries_enabled: bool,
    /// Artifacts larger than this when serialized are left out of portable snapshots.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,
}

fn default_max_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_artifact_bytes() -> usize {
    64 * 1024
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retries_enabled: true,
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

/// Map an error to a failure reason.
///
/// The innermost error variant decides first; messages of otherwise opaque
/// errors are matched against known patterns.
pub fn classify(err: &TaskweaveError) -> FailureReason {
    match err.root() {
        TaskweaveError::MissingCapability(_) => FailureReason::MissingCapability,
        TaskweaveError::MissingCredential(_) => FailureReason::MissingCredential,
        TaskweaveError::Network(_) => FailureReason::TransientNetwork,
        TaskweaveError::Timeout { .. } => FailureReason::Timeout,
        TaskweaveError::Io(e) => match e.kind() {
            std::io::ErrorKind::TimedOut => FailureReason::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => FailureReason::TransientNetwork,
            _ => classify_message(&e.to_string()),
        },
        other => classify_message(&other.to_string()),
    }
}

/// Classify a free-form error message.
pub fn classify_message(message: &str) -> FailureReason {
    let msg = message.to_lowercase();

    if msg.contains("credential")
        || msg.contains("api key")
        || msg.contains("api_key")
        || msg.contains("unauthorized")
        || msg.contains("401")
    {
        return FailureReason::MissingCredential;
    }
    if msg.contains("command not found")
        || msg.contains("unknown tool")
        || msg.contains("not available")
        || msg.contains("no such capability")
        || msg.contains("not installed")
    {
        return FailureReason::MissingCapability;
    }
    if msg.contains("timed out") || msg.contains("timeout") || msg.contains("deadline") {
        return FailureReason::Timeout;
    }
    if msg.contains("connection")
        || msg.contains("network")
        || msg.contains("dns")
        || msg.contains("rate limit")
        || msg.contains("429")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
        || msg.contains("temporarily unavailable")
    {
        return FailureReason::TransientNetwork;
    }
    FailureReason::Unclassified
}

/// What to do after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Run the same path again.
    Retry,
    /// Switch to the alternate path.
    Fallback,
}

/// A single decision with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackDecision {
    pub agent: String,
    pub reason: FailureReason,
    pub retry_count: u32,
    pub action: FallbackAction,
}

impl FallbackDecision {
    pub fn is_fallback(&self) -> bool {
        self.action == FallbackAction::Fallback
    }
}

/// Aggregate counters kept by the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    /// Decisions made.
    pub total_invocations: u64,
    pub by_reason: BTreeMap<FailureReason, u64>,
    pub by_agent: BTreeMap<String, u64>,
    pub retries: u64,
    pub fallbacks: u64,
    pub successful_fallbacks: u64,
    pub failed_fallbacks: u64,
    /// Failures that wanted a fallback but had no alternate path.
    pub abandoned: u64,
}

/// Minimal serializable view of a record handed to an alternate path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortableContext {
    pub id: Uuid,
    pub task: String,
    pub shared_artifacts: serde_json::Map<String, serde_json::Value>,
    /// Artifact keys left out of the snapshot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_keys: Vec<String>,
}

#[derive(Default)]
struct PolicyState {
    stats: FallbackStats,
    events: HashMap<String, Vec<FallbackRecord>>,
}

/// Decides retry-same-path versus fallback and keeps statistics about both.
pub struct FallbackPolicy {
    config: FallbackConfig,
    state: Mutex<PolicyState>,
}

impl FallbackPolicy {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PolicyState::default()),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Classify `err` and decide what to do, counting the decision.
    pub fn decide(&self, agent: &str, err: &TaskweaveError, retry_count: u32) -> FallbackDecision {
        let reason = classify(err);
        let fallback = !self.config.retries_enabled
            || !reason.is_retryable()
            || retry_count >= self.config.max_retries;
        let action = if fallback {
            FallbackAction::Fallback
        } else {
            FallbackAction::Retry
        };

        {
            let mut state = self.state.lock();
            let stats = &mut state.stats;
            stats.total_invocations += 1;
            *stats.by_reason.entry(reason).or_default() += 1;
            *stats.by_agent.entry(agent.to_string()).or_default() += 1;
            match action {
                FallbackAction::Retry => stats.retries += 1,
                FallbackAction::Fallback => stats.fallbacks += 1,
            }
        }

        info!(
            agent,
            reason = %reason,
            retry_count,
            action = ?action,
            error = %err,
            "Fallback policy decision"
        );
        FallbackDecision {
            agent: agent.to_string(),
            reason,
            retry_count,
            action,
        }
    }

    /// Whether a failure should switch to the alternate path now.
    pub fn should_fallback(&self, agent: &str, err: &TaskweaveError, retry_count: u32) -> bool {
        self.decide(agent, err, retry_count).is_fallback()
    }

    /// Record the outcome of a fallback attempt.
    pub fn log_fallback(&self, event: FallbackRecord) {
        let mut state = self.state.lock();
        if event.success {
            state.stats.successful_fallbacks += 1;
        } else {
            state.stats.failed_fallbacks += 1;
        }
        info!(
            agent = %event.agent,
            reason = %event.reason,
            target = %event.fallback_target,
            success = event.success,
            "Fallback logged"
        );
        state
            .events
            .entry(event.agent.clone())
            .or_default()
            .push(event);
    }

    /// Count a failure that had nowhere to fall back to.
    pub fn record_abandoned(&self, agent: &str, reason: FailureReason) {
        self.state.lock().stats.abandoned += 1;
        warn!(agent, reason = %reason, "No fallback available, abandoning step");
    }

    /// True once `agent` has logged at least `threshold` fallback events.
    pub fn alert_on_repeated_failures(&self, agent: &str, threshold: usize) -> bool {
        let count = self
            .state
            .lock()
            .events
            .get(agent)
            .map(Vec::len)
            .unwrap_or(0);
        let alert = count >= threshold;
        if alert {
            warn!(agent, count, threshold, "Repeated fallback failures");
        }
        alert
    }

    pub fn fallback_events(&self, agent: &str) -> Vec<FallbackRecord> {
        self.state
            .lock()
            .events
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> FallbackStats {
        self.state.lock().stats.clone()
    }

    /// Build a best-effort portable snapshot of `record`.
    pub fn convert_context(&self, record: &ContextRecord) -> PortableContext {
        let mut keys: Vec<&String> = record.shared_artifacts.keys().collect();
        keys.sort();

        let mut shared_artifacts = serde_json::Map::new();
        let mut dropped_keys = Vec::new();
        for key in keys {
            let value = &record.shared_artifacts[key];
            match serde_json::to_vec(value) {
                Ok(bytes) if bytes.len() <= self.config.max_artifact_bytes => {
                    shared_artifacts.insert(key.clone(), value.clone());
                }
                Ok(bytes) => {
                    warn!(
                        record_id = %record.id,
                        key = %key,
                        size = bytes.len(),
                        limit = self.config.max_artifact_bytes,
                        "Dropping oversized artifact from portable context"
                    );
                    dropped_keys.push(key.clone());
                }
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        key = %key,
                        error = %e,
                        "Dropping unserializable artifact from portable context"
                    );
                    dropped_keys.push(key.clone());
                }
            }
        }

        PortableContext {
            id: record.id,
            task: record.task.clone(),
            shared_artifacts,
            dropped_keys,
        }
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(FallbackConfig::default())
    }
}
