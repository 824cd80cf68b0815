use crate::failure::FailureReason;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// A single engine event, scoped to one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// The run that produced it.
    pub run_id: Uuid,
    /// The context record the run operates on.
    pub record_id: Uuid,
    /// What happened.
    pub event: TelemetryEvent,
}

/// Kinds of events the workflow engine reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A run began.
    RunStarted {
        /// `sequential`, `parallel` or `conditional`.
        strategy: String,
        /// Number of steps submitted.
        steps: usize,
    },
    /// A step was handed to its adapter.
    StepStarted {
        /// Step name.
        agent: String,
    },
    /// A step reached a terminal state.
    StepFinished {
        /// Step name.
        agent: String,
        /// Whether it completed.
        success: bool,
        /// Wall-clock time spent on the step.
        duration_ms: u64,
    },
    /// A conditional step was not run.
    StepSkipped {
        /// Step name.
        agent: String,
        /// Why the step was skipped.
        reason: String,
    },
    /// The fallback policy made a decision about a failure.
    FallbackDecision {
        /// Step name.
        agent: String,
        /// Classified failure reason.
        reason: FailureReason,
        /// `true` when switching paths, `false` when retrying the same path.
        fallback: bool,
    },
    /// A run finished.
    RunFinished {
        /// Final run status.
        status: String,
        /// Total run time.
        duration_ms: u64,
    },
}

/// Receiver for engine telemetry. Injected at engine construction.
pub trait TelemetrySink: Send + Sync {
    /// Record a single entry. Must not block.
    fn record(&self, entry: TelemetryEntry);
}

/// Sink that forwards every entry to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, entry: TelemetryEntry) {
        let run_id = entry.run_id;
        let record_id = entry.record_id;
        match &entry.event {
            TelemetryEvent::StepFinished {
                agent,
                success: false,
                duration_ms,
            } => {
                warn!(%run_id, %record_id, agent = %agent, duration_ms, "step failed");
            }
            event => {
                info!(%run_id, %record_id, event = ?event, "telemetry");
            }
        }
    }
}

/// Sink that keeps entries in memory. Useful for diagnostics and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<TelemetryEntry>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn entries(&self) -> Vec<TelemetryEntry> {
        self.entries.lock().clone()
    }

    /// Entries belonging to one run.
    pub fn for_run(&self, run_id: Uuid) -> Vec<TelemetryEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Number of entries recorded.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, entry: TelemetryEntry) {
        self.entries.lock().push(entry);
    }
}

/// Per-run handle that stamps every event with its run and record ids.
#[derive(Clone)]
pub struct RunTelemetry {
    sink: std::sync::Arc<dyn TelemetrySink>,
    run_id: Uuid,
    record_id: Uuid,
}

impl RunTelemetry {
    /// Scope a sink to one run.
    pub fn new(sink: std::sync::Arc<dyn TelemetrySink>, run_id: Uuid, record_id: Uuid) -> Self {
        Self {
            sink,
            run_id,
            record_id,
        }
    }

    /// The run this handle is scoped to.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Emit one event.
    pub fn emit(&self, event: TelemetryEvent) {
        self.sink.record(TelemetryEntry {
            timestamp: Utc::now(),
            run_id: self.run_id,
            record_id: self.record_id,
            event,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_run_telemetry_scopes_entries() {
        let sink = Arc::new(MemorySink::new());
        let a = RunTelemetry::new(sink.clone(), Uuid::new_v4(), Uuid::new_v4());
        let b = RunTelemetry::new(sink.clone(), Uuid::new_v4(), Uuid::new_v4());

        a.emit(TelemetryEvent::StepStarted { agent: "x".into() });
        b.emit(TelemetryEvent::StepStarted { agent: "y".into() });
        a.emit(TelemetryEvent::RunFinished {
            status: "completed".into(),
            duration_ms: 3,
        });

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.for_run(a.run_id()).len(), 2);
        assert_eq!(sink.for_run(b.run_id()).len(), 1);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(TelemetryEvent::FallbackDecision {
            agent: "search".into(),
            reason: FailureReason::Timeout,
            fallback: true,
        })
        .unwrap();
        assert_eq!(json["type"], "fallback_decision");
        assert_eq!(json["reason"], "timeout");
    }
}
