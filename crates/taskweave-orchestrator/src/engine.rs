use crate::health::HealthReport;
use crate::types::{EngineConfig, RunStatus, Strategy, WorkflowResult, WorkflowStep};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use taskweave_agent::{AgentAdapter, FallbackPolicy};
use taskweave_context::{
    ContextHandle, ContextRecord, ContextStore, FallbackRecord, RecordLocks, CANCELLED_PHASE,
};
use taskweave_core::{
    FailureReason, RunTelemetry, TaskweaveError, TaskweaveResult, TelemetryEvent, TelemetrySink,
    TracingSink,
};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs lists of agents against a shared context record.
///
/// Every run loads the record from the store, wraps it in one
/// [`ContextHandle`] shared by all of the run's agents, executes the steps
/// under the chosen [`Strategy`], and persists the outcome. Adapter-exhausted
/// agents become step failures routed through the [`FallbackPolicy`]; store
/// failures abort the run and are returned to the caller.
pub struct WorkflowEngine {
    store: Arc<dyn ContextStore>,
    adapter: Arc<AgentAdapter>,
    policy: Arc<FallbackPolicy>,
    telemetry: Arc<dyn TelemetrySink>,
    config: EngineConfig,
    locks: RecordLocks,
    runs: Mutex<HashMap<Uuid, RunStatus>>,
    /// Handles of in-flight runs, so administrative writes go through them.
    live: Mutex<HashMap<Uuid, Weak<ContextHandle>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn ContextStore>,
        adapter: Arc<AgentAdapter>,
        policy: Arc<FallbackPolicy>,
    ) -> Self {
        Self {
            store,
            adapter,
            policy,
            telemetry: Arc::new(TracingSink),
            config: EngineConfig::default(),
            locks: RecordLocks::new(),
            runs: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<FallbackPolicy> {
        &self.policy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Status of the most recent run against `record_id`.
    pub fn run_status(&self, record_id: Uuid) -> RunStatus {
        self.runs
            .lock()
            .get(&record_id)
            .copied()
            .unwrap_or(RunStatus::NotStarted)
    }

    pub async fn run_sequential(
        &self,
        record_id: Uuid,
        steps: Vec<WorkflowStep>,
    ) -> TaskweaveResult<WorkflowResult> {
        self.run(record_id, Strategy::Sequential, steps).await
    }

    pub async fn run_parallel(
        &self,
        record_id: Uuid,
        steps: Vec<WorkflowStep>,
    ) -> TaskweaveResult<WorkflowResult> {
        self.run(record_id, Strategy::Parallel, steps).await
    }

    pub async fn run_conditional(
        &self,
        record_id: Uuid,
        steps: Vec<WorkflowStep>,
    ) -> TaskweaveResult<WorkflowResult> {
        self.run(record_id, Strategy::Conditional, steps).await
    }

    /// Run on the path the health report allows: the primary agents when it
    /// is ready for them, each step's fallback agent when only the fallback
    /// path is ready, and nothing otherwise.
    pub async fn run_with_health(
        &self,
        report: &HealthReport,
        record_id: Uuid,
        strategy: Strategy,
        steps: Vec<WorkflowStep>,
    ) -> TaskweaveResult<WorkflowResult> {
        if report.ready_for_primary {
            return self.run(record_id, strategy, steps).await;
        }
        if report.ready_for_fallback {
            warn!(
                record_id = %record_id,
                critical = ?report.critical_checks(),
                "Primary path not ready, running fallback agents"
            );
            let steps = steps
                .into_iter()
                .map(|mut step| {
                    if let Some(fallback) = step.fallback.take() {
                        step.agent = fallback;
                    }
                    step
                })
                .collect();
            return self.run(record_id, strategy, steps).await;
        }

        {
            let mut runs = self.runs.lock();
            if runs.get(&record_id) != Some(&RunStatus::Running) {
                runs.insert(record_id, RunStatus::Failed);
            }
        }
        error!(
            record_id = %record_id,
            critical = ?report.critical_checks(),
            "Neither execution path is ready"
        );
        Err(TaskweaveError::Engine(format!(
            "health checks failed: {}",
            report.critical_checks().join(", ")
        )))
    }

    /// Execute `steps` against the record under `strategy`.
    pub async fn run(
        &self,
        record_id: Uuid,
        strategy: Strategy,
        steps: Vec<WorkflowStep>,
    ) -> TaskweaveResult<WorkflowResult> {
        let run_id = Uuid::new_v4();
        let telemetry = RunTelemetry::new(self.telemetry.clone(), run_id, record_id);
        let mut result = WorkflowResult::new(run_id, record_id, strategy);
        let start = Instant::now();

        {
            let mut runs = self.runs.lock();
            let in_flight = runs.get(&record_id) == Some(&RunStatus::Running)
                || self
                    .live
                    .lock()
                    .get(&record_id)
                    .is_some_and(|h| h.strong_count() > 0);
            if in_flight {
                return Err(TaskweaveError::Engine(format!(
                    "record {record_id} already has a run in progress"
                )));
            }
            runs.insert(record_id, RunStatus::Running);
        }

        info!(
            run_id = %run_id,
            record_id = %record_id,
            strategy = %strategy,
            steps = steps.len(),
            "Workflow run starting"
        );
        let outcome = self.drive(&telemetry, &mut result, steps).await;

        {
            let mut live = self.live.lock();
            if live.get(&record_id).is_some_and(|h| h.strong_count() == 0) {
                live.remove(&record_id);
            }
        }
        self.locks.prune();
        result.finished_at = Utc::now();
        result.duration_ms = elapsed_ms(start);

        match outcome {
            Ok(()) => {
                self.runs.lock().insert(record_id, result.status);
                telemetry.emit(TelemetryEvent::RunFinished {
                    status: result.status.to_string(),
                    duration_ms: result.duration_ms,
                });
                info!(
                    run_id = %run_id,
                    record_id = %record_id,
                    status = %result.status,
                    completed = result.agents_completed.len(),
                    failed = result.agents_failed.len(),
                    skipped = result.agents_skipped.len(),
                    duration_ms = result.duration_ms,
                    "Workflow run finished"
                );
                Ok(result)
            }
            Err(e) => {
                self.runs.lock().insert(record_id, RunStatus::Failed);
                telemetry.emit(TelemetryEvent::RunFinished {
                    status: RunStatus::Failed.to_string(),
                    duration_ms: result.duration_ms,
                });
                error!(run_id = %run_id, record_id = %record_id, error = %e, "Workflow run aborted");
                Err(e)
            }
        }
    }

    /// Mark the record cancelled so no later run starts against it.
    ///
    /// An in-flight run is not interrupted; its remaining steps run to
    /// completion or timeout.
    pub async fn cancel(&self, record_id: Uuid) -> TaskweaveResult<ContextRecord> {
        let live = self.live.lock().get(&record_id).and_then(Weak::upgrade);
        let record = match live {
            Some(handle) => {
                handle.update(|r| r.phase = CANCELLED_PHASE.to_string());
                handle.save().await?;
                handle.snapshot()
            }
            None => {
                let lock = self.locks.lock_for(record_id);
                let _guard = lock.lock().await;
                let mut record = self.store.get(record_id).await?;
                record.phase = CANCELLED_PHASE.to_string();
                self.store.save(&mut record).await?;
                record
            }
        };

        {
            let mut runs = self.runs.lock();
            if runs.get(&record_id) != Some(&RunStatus::Running) {
                runs.insert(record_id, RunStatus::Cancelled);
            }
        }
        info!(record_id = %record_id, version = record.version, "Record cancelled");
        Ok(record)
    }

    async fn drive(
        &self,
        telemetry: &RunTelemetry,
        result: &mut WorkflowResult,
        steps: Vec<WorkflowStep>,
    ) -> TaskweaveResult<()> {
        let record = self.store.get(result.record_id).await?;
        if record.is_archived() {
            return Err(TaskweaveError::ReadOnly(record.id));
        }
        if record.is_cancelled() {
            info!(record_id = %record.id, "Record is cancelled, no steps run");
            result.status = RunStatus::Cancelled;
            return Ok(());
        }

        telemetry.emit(TelemetryEvent::RunStarted {
            strategy: result.strategy.to_string(),
            steps: steps.len(),
        });
        let handle = Arc::new(ContextHandle::new(
            record,
            self.store.clone(),
            self.locks.lock_for(result.record_id),
        ));
        {
            let mut live = self.live.lock();
            if live
                .get(&result.record_id)
                .is_some_and(|h| h.strong_count() > 0)
            {
                return Err(TaskweaveError::Engine(format!(
                    "record {} already has a live handle",
                    result.record_id
                )));
            }
            live.insert(result.record_id, Arc::downgrade(&handle));
        }

        let runner = StepRunner {
            adapter: self.adapter.clone(),
            policy: self.policy.clone(),
            telemetry: telemetry.clone(),
            alert_threshold: self.config.alert_threshold,
        };
        match result.strategy {
            Strategy::Sequential => self.run_in_order(&runner, &handle, steps, false, result).await?,
            Strategy::Conditional => self.run_in_order(&runner, &handle, steps, true, result).await?,
            Strategy::Parallel => self.run_batch(&runner, &handle, steps, result).await?,
        }
        self.finish(&handle, result).await
    }

    async fn run_in_order(
        &self,
        runner: &StepRunner,
        handle: &Arc<ContextHandle>,
        steps: Vec<WorkflowStep>,
        conditional: bool,
        result: &mut WorkflowResult,
    ) -> TaskweaveResult<()> {
        for step in steps {
            if conditional {
                if let Some(reason) = skip_reason(handle, &step) {
                    info!(agent = %step.name, reason = %reason, "Step skipped");
                    runner.telemetry.emit(TelemetryEvent::StepSkipped {
                        agent: step.name.clone(),
                        reason,
                    });
                    result.agents_skipped.push(step.name);
                    continue;
                }
            }

            result.agents_run.push(step.name.clone());
            match runner.run_step(handle, &step).await? {
                StepOutcome::Completed(output) => {
                    result.agents_completed.push(step.name.clone());
                    result.outputs.insert(step.name, output);
                }
                StepOutcome::Failed(message) => {
                    result.record_failure(&step.name, message);
                    break;
                }
            }
        }

        result.status = if result.agents_failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        Ok(())
    }

    async fn run_batch(
        &self,
        runner: &StepRunner,
        handle: &Arc<ContextHandle>,
        steps: Vec<WorkflowStep>,
        result: &mut WorkflowResult,
    ) -> TaskweaveResult<()> {
        let permits = self.config.max_parallel.min(steps.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut tasks = Vec::with_capacity(steps.len());
        for step in steps {
            let name = step.name.clone();
            let runner = runner.clone();
            let handle = handle.clone();
            let semaphore = semaphore.clone();
            result.agents_run.push(name.clone());
            let task = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| TaskweaveError::Engine("parallel step pool closed".into()))?;
                runner.run_step(&handle, &step).await
            });
            tasks.push((name, task));
        }

        // Collect every branch before acting on any engine error.
        let mut engine_error = None;
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(StepOutcome::Completed(output))) => {
                    result.agents_completed.push(name.clone());
                    result.outputs.insert(name, output);
                }
                Ok(Ok(StepOutcome::Failed(message))) => result.record_failure(&name, message),
                Ok(Err(e)) => {
                    error!(agent = %name, error = %e, "Parallel step aborted");
                    engine_error.get_or_insert(e);
                }
                Err(join_error) => {
                    let message = format!("step task failed: {join_error}");
                    error!(agent = %name, error = %message, "Parallel step panicked");
                    handle.update(|r| r.mark_agent_failed(&name, message.clone()));
                    result.record_failure(&name, message);
                }
            }
        }
        if let Some(e) = engine_error {
            return Err(e);
        }
        handle.save().await?;

        result.status = match (
            result.agents_completed.is_empty(),
            result.agents_failed.is_empty(),
        ) {
            (_, true) => RunStatus::Completed,
            (false, false) => RunStatus::Partial,
            (true, false) => RunStatus::Failed,
        };
        Ok(())
    }

    async fn finish(
        &self,
        handle: &Arc<ContextHandle>,
        result: &WorkflowResult,
    ) -> TaskweaveResult<()> {
        let status = result.status;
        let cancelled = handle.update(|r| {
            if r.is_cancelled() {
                return true;
            }
            r.phase = status.to_string();
            if status == RunStatus::Completed {
                r.completed_at = Some(Utc::now());
            }
            false
        });
        handle.save().await?;

        if status == RunStatus::Completed && self.config.archive_on_completion && !cancelled {
            let lock = self.locks.lock_for(handle.id());
            let _guard = lock.lock().await;
            self.store.archive(handle.id()).await?;
        }
        Ok(())
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn skip_reason(handle: &ContextHandle, step: &WorkflowStep) -> Option<String> {
    let condition = step.condition.as_ref()?;
    match handle.read(|r| condition(r)) {
        Ok(true) => None,
        Ok(false) => Some("condition not met".to_string()),
        Err(e) => Some(format!("condition failed: {e}")),
    }
}

enum StepOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

/// Everything a single step needs, cloneable into spawned tasks.
#[derive(Clone)]
struct StepRunner {
    adapter: Arc<AgentAdapter>,
    policy: Arc<FallbackPolicy>,
    telemetry: RunTelemetry,
    alert_threshold: usize,
}

impl StepRunner {
    async fn run_step(
        &self,
        handle: &Arc<ContextHandle>,
        step: &WorkflowStep,
    ) -> TaskweaveResult<StepOutcome> {
        let start = Instant::now();
        self.telemetry.emit(TelemetryEvent::StepStarted {
            agent: step.name.clone(),
        });
        let outcome = self.execute(handle, step).await?;
        self.telemetry.emit(TelemetryEvent::StepFinished {
            agent: step.name.clone(),
            success: matches!(outcome, StepOutcome::Completed(_)),
            duration_ms: elapsed_ms(start),
        });
        Ok(outcome)
    }

    async fn execute(
        &self,
        handle: &Arc<ContextHandle>,
        step: &WorkflowStep,
    ) -> TaskweaveResult<StepOutcome> {
        let mut retry_count = 0;
        loop {
            let err = match self
                .adapter
                .execute(handle, step.agent.as_ref(), &step.name)
                .await
            {
                Ok(output) => return Ok(StepOutcome::Completed(output)),
                Err(e) if e.is_agent_failure() => e,
                Err(e) => return Err(e),
            };

            let decision = self.policy.decide(&step.name, &err, retry_count);
            self.telemetry.emit(TelemetryEvent::FallbackDecision {
                agent: step.name.clone(),
                reason: decision.reason,
                fallback: decision.is_fallback(),
            });
            if decision.is_fallback() {
                return self.fall_back(handle, step, decision.reason, err).await;
            }
            retry_count += 1;
        }
    }

    async fn fall_back(
        &self,
        handle: &Arc<ContextHandle>,
        step: &WorkflowStep,
        reason: FailureReason,
        err: TaskweaveError,
    ) -> TaskweaveResult<StepOutcome> {
        let Some(fallback) = &step.fallback else {
            self.policy.record_abandoned(&step.name, reason);
            return Ok(StepOutcome::Failed(err.to_string()));
        };

        let portable = self.policy.convert_context(&handle.snapshot());
        info!(
            agent = %step.name,
            target = fallback.name(),
            reason = %reason,
            dropped_artifacts = portable.dropped_keys.len(),
            "Switching to fallback path"
        );
        let result = self
            .adapter
            .execute(handle, fallback.as_ref(), &step.name)
            .await;

        let mut message = err.to_string();
        if !portable.dropped_keys.is_empty() {
            message.push_str(&format!(
                "; not carried over: {}",
                portable.dropped_keys.join(", ")
            ));
        }
        let event = FallbackRecord {
            agent: step.name.clone(),
            reason,
            fallback_target: fallback.name().to_string(),
            success: result.is_ok(),
            timestamp: Utc::now(),
            message,
        };
        handle.update(|r| r.fallback_log.push(event.clone()));
        self.policy.log_fallback(event);
        self.policy
            .alert_on_repeated_failures(&step.name, self.alert_threshold);

        match result {
            Ok(output) => {
                handle.save().await?;
                Ok(StepOutcome::Completed(output))
            }
            Err(e) if e.is_agent_failure() => {
                handle.save().await?;
                Ok(StepOutcome::Failed(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskweave_agent::AdapterConfig;
    use taskweave_context::{FileContextStore, RecordMetadata};
    use taskweave_core::CapabilityRegistry;
    use tempfile::TempDir;

    async fn engine(tmp: &TempDir) -> WorkflowEngine {
        let store: Arc<dyn ContextStore> =
            Arc::new(FileContextStore::new(tmp.path()).await.unwrap());
        let adapter = AgentAdapter::new(
            AdapterConfig::default(),
            Arc::new(CapabilityRegistry::new()),
        );
        WorkflowEngine::new(store, Arc::new(adapter), Arc::new(FallbackPolicy::default()))
    }

    #[tokio::test]
    async fn test_unknown_record_is_not_started() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        assert_eq!(engine.run_status(Uuid::new_v4()), RunStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_run_against_missing_record_fails() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let id = Uuid::new_v4();
        let err = engine.run_sequential(id, Vec::new()).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::NotFound(_)));
        assert_eq!(engine.run_status(id), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_run_completes_and_archives() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let record = engine
            .store()
            .create("nothing to do", RecordMetadata::default())
            .await
            .unwrap();

        let result = engine.run_parallel(record.id, Vec::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let stored = engine.store().get(record.id).await.unwrap();
        assert!(stored.is_archived());
        assert_eq!(stored.phase, "completed");
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_archived_record_is_read_only() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let record = engine
            .store()
            .create("t", RecordMetadata::default())
            .await
            .unwrap();
        engine.store().archive(record.id).await.unwrap();

        let err = engine.cancel(record.id).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_cancel_during_completion_never_resurrects_archived_record() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileContextStore::new(tmp.path()).await.unwrap());
        let adapter = AgentAdapter::new(
            AdapterConfig::default(),
            Arc::new(CapabilityRegistry::new()),
        );
        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(adapter),
            Arc::new(FallbackPolicy::default()),
        );

        for _ in 0..20 {
            let record = store
                .create("race", RecordMetadata::default())
                .await
                .unwrap();
            let (run, cancel) = tokio::join!(
                engine.run_parallel(record.id, Vec::new()),
                engine.cancel(record.id)
            );
            run.unwrap();
            if let Err(e) = cancel {
                assert!(matches!(e, TaskweaveError::ReadOnly(_)), "{e}");
            }

            let file = format!("{}.json", record.id);
            let active = store.active_dir().join(&file).exists();
            let archived = store.archived_dir().join(&file).exists();
            assert!(active != archived, "record must live in exactly one location");
        }
    }
}
