use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskweave_context::{CapabilityUsage, CommandExecution, ContextHandle};
use taskweave_core::{CapabilityRegistry, TaskweaveError, TaskweaveResult};

/// A unit of domain work run against a shared context record.
///
/// `process` may be invoked again after a partial failure and sees whatever
/// the earlier attempt already wrote; implementations must tolerate that.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Implementation name, used in logs.
    fn name(&self) -> &str;

    /// Do the work. The returned payload is opaque to the engine.
    async fn process(&self, ctx: &AgentContext) -> TaskweaveResult<serde_json::Value>;
}

/// What an agent sees while it runs: the shared record plus bookkeeping
/// helpers that write into its own `AgentState`.
pub struct AgentContext {
    handle: Arc<ContextHandle>,
    agent: String,
    capabilities: Arc<CapabilityRegistry>,
    capability_timeout: Duration,
    attempt: u32,
}

impl AgentContext {
    pub fn new(
        handle: Arc<ContextHandle>,
        agent: impl Into<String>,
        capabilities: Arc<CapabilityRegistry>,
        capability_timeout: Duration,
        attempt: u32,
    ) -> Self {
        Self {
            handle,
            agent: agent.into(),
            capabilities,
            capability_timeout,
            attempt,
        }
    }

    /// Name the agent's state is recorded under.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// One-based attempt number within the current execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn handle(&self) -> &Arc<ContextHandle> {
        &self.handle
    }

    pub fn task(&self) -> String {
        self.handle.task()
    }

    pub fn artifact(&self, key: &str) -> Option<serde_json::Value> {
        self.handle.artifact(key)
    }

    pub fn set_artifact(&self, key: impl Into<String>, value: serde_json::Value) {
        self.handle.set_artifact(key, value);
    }

    /// Call an external capability and log the call in this agent's usage log.
    pub async fn invoke_capability(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> TaskweaveResult<serde_json::Value> {
        let start = Instant::now();
        let result = self
            .capabilities
            .invoke_capability(name, args, self.capability_timeout)
            .await;
        let usage = CapabilityUsage {
            capability: name.to_string(),
            success: result.is_ok(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.handle.update(|r| {
            r.agent_state_mut(&self.agent).capability_usage.push(usage);
        });
        result
    }

    /// Append to the record's command log.
    pub fn record_command(
        &self,
        command: impl Into<String>,
        success: bool,
        duration: Duration,
        output: Option<String>,
    ) {
        let entry = CommandExecution {
            agent: self.agent.clone(),
            command: command.into(),
            success,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
            output,
        };
        self.handle.update(|r| r.command_log.push(entry));
    }

    /// Add files to this agent's `files_touched`, skipping ones already listed.
    pub fn record_files<I, S>(&self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files: Vec<String> = files.into_iter().map(Into::into).collect();
        self.handle.update(|r| {
            let state = r.agent_state_mut(&self.agent);
            for file in files {
                if !state.files_touched.contains(&file) {
                    state.files_touched.push(file);
                }
            }
        });
    }

    pub fn set_tests_passed(&self, passed: bool) {
        self.handle
            .update(|r| r.agent_state_mut(&self.agent).tests_passed = Some(passed));
    }

    /// Read a credential from the environment.
    pub fn require_credential(&self, var: &str) -> TaskweaveResult<String> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(TaskweaveError::MissingCredential(var.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskweave_context::{ContextStore, FileContextStore, RecordLocks, RecordMetadata};
    use taskweave_core::{Capability, CapabilityResponse};
    use tempfile::TempDir;

    struct Search;

    #[async_trait]
    impl Capability for Search {
        fn name(&self) -> &str {
            "web_search"
        }

        async fn invoke(&self, args: serde_json::Value) -> CapabilityResponse {
            CapabilityResponse::success(json!({ "hits": [args["q"].clone()] }))
        }
    }

    async fn context(tmp: &TempDir) -> AgentContext {
        let store: Arc<dyn ContextStore> =
            Arc::new(FileContextStore::new(tmp.path()).await.unwrap());
        let record = store.create("t", RecordMetadata::default()).await.unwrap();
        let lock = RecordLocks::new().lock_for(record.id);
        let handle = Arc::new(ContextHandle::new(record, store, lock));
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(Search));
        AgentContext::new(
            handle,
            "researcher",
            Arc::new(registry),
            Duration::from_secs(1),
            1,
        )
    }

    #[tokio::test]
    async fn test_capability_usage_is_logged() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;

        let data = ctx
            .invoke_capability("web_search", json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(data["hits"][0], "rust");
        let err = ctx.invoke_capability("ocr", json!({})).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::MissingCapability(_)));

        let usage = ctx
            .handle()
            .read(|r| r.agent_state("researcher").unwrap().capability_usage.clone());
        assert_eq!(usage.len(), 2);
        assert!(usage[0].success);
        assert!(!usage[1].success);
        assert!(usage[1].error.as_deref().unwrap().contains("ocr"));
    }

    #[tokio::test]
    async fn test_files_commands_and_tests() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;

        ctx.record_files(["src/lib.rs", "src/main.rs"]);
        ctx.record_files(["src/lib.rs"]);
        ctx.set_tests_passed(true);
        ctx.record_command("cargo fmt", true, Duration::from_millis(40), None);

        let record = ctx.handle().snapshot();
        let state = record.agent_state("researcher").unwrap();
        assert_eq!(state.files_touched, vec!["src/lib.rs", "src/main.rs"]);
        assert_eq!(state.tests_passed, Some(true));
        assert_eq!(record.command_log.len(), 1);
        assert_eq!(record.command_log[0].agent, "researcher");
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        let err = ctx
            .require_credential("TASKWEAVE_TEST_SURELY_UNSET_CREDENTIAL")
            .unwrap_err();
        assert!(matches!(err, TaskweaveError::MissingCredential(_)));
    }
}
