use crate::agent::{Agent, AgentContext};
use crate::config::{compute_backoff, AdapterConfig};
use crate::hooks::HookRunner;
use std::sync::Arc;
use taskweave_context::{ContextHandle, HookKind};
use taskweave_core::{CapabilityRegistry, TaskweaveError, TaskweaveResult};
use tracing::{error, info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Uniform lifecycle wrapper around one agent execution.
///
/// Marks the agent in progress, retries `process` with exponential backoff
/// under a wall-clock timeout, records the outcome in the agent's state and
/// persists the record. Only an exhausted agent surfaces as
/// [`TaskweaveError::AgentFailed`]; persistence errors are returned as-is.
pub struct AgentAdapter {
    config: AdapterConfig,
    capabilities: Arc<CapabilityRegistry>,
    hooks: Option<HookRunner>,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl AgentAdapter {
    pub fn new(config: AdapterConfig, capabilities: Arc<CapabilityRegistry>) -> Self {
        let hooks = config
            .hook_capability
            .as_ref()
            .map(|name| HookRunner::new(name, config.hook_timeout(), capabilities.clone()));
        Self {
            config,
            capabilities,
            hooks,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    async fn hook(&self, handle: &ContextHandle, name: &str, kind: HookKind, detail: Option<String>) {
        if let Some(hooks) = &self.hooks {
            hooks.emit(handle, name, kind, detail).await;
        }
    }

    /// Run `agent` under the state slot `name` and return its payload.
    pub async fn execute(
        &self,
        handle: &Arc<ContextHandle>,
        agent: &dyn Agent,
        name: &str,
    ) -> TaskweaveResult<serde_json::Value> {
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = self.config.agent_timeout();

        handle.update(|r| r.mark_agent_started(name));
        self.hook(handle, name, HookKind::BeforeAgent, None).await;
        info!(agent = name, implementation = agent.name(), max_attempts, "Agent started");

        let mut attempt = 0;
        loop {
            attempt += 1;
            handle.update(|r| r.agent_state_mut(name).attempts = attempt);
            let ctx = AgentContext::new(
                handle.clone(),
                name,
                self.capabilities.clone(),
                self.config.capability_timeout(),
                attempt,
            );

            let result = match tokio::time::timeout(timeout, agent.process(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(TaskweaveError::timeout(format!("agent '{name}'"), timeout)),
            };

            let err = match result {
                Ok(output) => {
                    handle.update(|r| r.mark_agent_completed(name));
                    self.hook(handle, name, HookKind::AfterAgent, None).await;
                    handle.save().await?;
                    info!(agent = name, attempt, "Agent completed");
                    return Ok(output);
                }
                Err(e) => e,
            };

            let message = err.to_string();
            if attempt >= max_attempts {
                handle.update(|r| r.mark_agent_failed(name, message.clone()));
                self.hook(handle, name, HookKind::AgentError, Some(message.clone()))
                    .await;
                handle.save().await?;
                error!(agent = name, attempts = attempt, error = %message, "Agent failed");
                return Err(TaskweaveError::AgentFailed {
                    agent: name.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            handle.update(|r| r.mark_agent_retrying(name, message.clone()));
            self.hook(handle, name, HookKind::AgentError, Some(message.clone()))
                .await;
            let delay = compute_backoff(&self.config, attempt - 1);
            warn!(
                agent = name,
                attempt,
                delay_ms = delay,
                error = %message,
                "Agent attempt failed, backing off"
            );
            self.do_sleep(delay).await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use taskweave_context::{
        AgentStatus, ContextStore, FileContextStore, RecordLocks, RecordMetadata,
    };
    use taskweave_core::{Capability, CapabilityResponse};
    use tempfile::TempDir;

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Agent for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(&self, ctx: &AgentContext) -> TaskweaveResult<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.set_artifact(format!("attempt-{n}"), json!(true));
            if n <= self.failures {
                Err(TaskweaveError::Network(format!("connection reset #{n}")))
            } else {
                Ok(json!({ "calls": n }))
            }
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Agent for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        async fn process(&self, _ctx: &AgentContext) -> TaskweaveResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!(null))
        }
    }

    struct RecordingHook {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Capability for RecordingHook {
        fn name(&self) -> &str {
            "lifecycle"
        }

        async fn invoke(&self, args: serde_json::Value) -> CapabilityResponse {
            self.events
                .lock()
                .push(args["event"].as_str().unwrap_or_default().to_string());
            CapabilityResponse::success(json!({}))
        }
    }

    async fn handle(tmp: &TempDir) -> (Arc<dyn ContextStore>, Arc<ContextHandle>) {
        let store: Arc<dyn ContextStore> =
            Arc::new(FileContextStore::new(tmp.path()).await.unwrap());
        let record = store.create("t", RecordMetadata::default()).await.unwrap();
        let lock = RecordLocks::new().lock_for(record.id);
        let handle = Arc::new(ContextHandle::new(record, store.clone(), lock));
        (store, handle)
    }

    fn recording_adapter(config: AdapterConfig, delays: Arc<Mutex<Vec<u64>>>) -> AgentAdapter {
        let mut adapter = AgentAdapter::new(config, Arc::new(CapabilityRegistry::new()));
        adapter.sleep_fn = Some(Box::new(move |ms| {
            delays.lock().push(ms);
            Box::pin(async {})
        }));
        adapter
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let tmp = TempDir::new().unwrap();
        let (store, handle) = handle(&tmp).await;
        let delays = Arc::new(Mutex::new(Vec::new()));
        let adapter = recording_adapter(AdapterConfig::default(), delays.clone());

        let output = adapter
            .execute(&handle, &Flaky::new(2), "fetcher")
            .await
            .unwrap();
        assert_eq!(output["calls"], 3);
        assert_eq!(*delays.lock(), vec![1_000, 2_000]);

        let record = handle.snapshot();
        let state = record.agent_state("fetcher").unwrap();
        assert_eq!(state.status, AgentStatus::Completed);
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.attempts, 3);
        assert!(state.last_error.as_deref().unwrap().contains("#2"));
        assert_eq!(record.agents_completed, vec!["fetcher"]);
        assert!(record.current_agent.is_none());
        // Retried attempts see earlier partial writes.
        assert_eq!(record.shared_artifacts.len(), 3);

        let persisted = store.get(record.id).await.unwrap();
        assert_eq!(persisted.version, 2);
        assert_eq!(persisted.agents_completed, vec!["fetcher"]);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_mark_failed() {
        let tmp = TempDir::new().unwrap();
        let (store, handle) = handle(&tmp).await;
        let delays = Arc::new(Mutex::new(Vec::new()));
        let adapter = recording_adapter(AdapterConfig::default(), delays.clone());

        let err = adapter
            .execute(&handle, &Flaky::new(10), "fetcher")
            .await
            .unwrap_err();
        match &err {
            TaskweaveError::AgentFailed {
                agent, attempts, ..
            } => {
                assert_eq!(agent, "fetcher");
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(err.root(), TaskweaveError::Network(_)));
        assert_eq!(delays.lock().len(), 2);

        let persisted = store.get(handle.id()).await.unwrap();
        let state = persisted.agent_state("fetcher").unwrap();
        assert_eq!(state.status, AgentStatus::Failed);
        assert!(persisted.agents_completed.is_empty());
        assert!(persisted.running_agents.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let tmp = TempDir::new().unwrap();
        let (_store, handle) = handle(&tmp).await;
        let config = AdapterConfig::default()
            .with_max_attempts(1)
            .with_agent_timeout(Duration::from_millis(20));
        let adapter = AgentAdapter::new(config, Arc::new(CapabilityRegistry::new()));

        let err = adapter.execute(&handle, &Sleeper, "slow").await.unwrap_err();
        assert!(matches!(err.root(), TaskweaveError::Timeout { .. }));
        assert_eq!(
            handle.read(|r| r.agent_state("slow").unwrap().status),
            AgentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_hooks_are_recorded() {
        let tmp = TempDir::new().unwrap();
        let (_store, handle) = handle(&tmp).await;
        let hook = Arc::new(RecordingHook {
            events: Mutex::new(Vec::new()),
        });
        let mut registry = CapabilityRegistry::new();
        registry.register(hook.clone());
        let config = AdapterConfig::default()
            .with_backoff(0, 0)
            .with_hook_capability("lifecycle");
        let adapter = AgentAdapter::new(config, Arc::new(registry));

        adapter
            .execute(&handle, &Flaky::new(1), "fetcher")
            .await
            .unwrap();
        assert_eq!(
            *hook.events.lock(),
            vec!["before_agent", "agent_error", "after_agent"]
        );
        let kinds: Vec<HookKind> = handle.read(|r| r.hook_events.iter().map(|e| e.kind).collect());
        assert_eq!(
            kinds,
            vec![HookKind::BeforeAgent, HookKind::AgentError, HookKind::AfterAgent]
        );
    }

    #[tokio::test]
    async fn test_missing_hook_capability_does_not_fail_agent() {
        let tmp = TempDir::new().unwrap();
        let (_store, handle) = handle(&tmp).await;
        let config = AdapterConfig::default().with_hook_capability("not-registered");
        let adapter = AgentAdapter::new(config, Arc::new(CapabilityRegistry::new()));

        adapter
            .execute(&handle, &Flaky::new(0), "fetcher")
            .await
            .unwrap();
        let events = handle.read(|r| r.hook_events.clone());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.success));
    }
}
