use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskweave_context::{ContextHandle, HookEvent, HookKind};
use taskweave_core::CapabilityRegistry;
use tracing::{debug, warn};

/// Fires lifecycle hooks through a named capability and logs each outcome in
/// the record's `hook_events`. Hook failures never propagate.
pub struct HookRunner {
    capability: String,
    timeout: Duration,
    capabilities: Arc<CapabilityRegistry>,
}

impl HookRunner {
    pub fn new(
        capability: impl Into<String>,
        timeout: Duration,
        capabilities: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            capability: capability.into(),
            timeout,
            capabilities,
        }
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Returns whether the hook succeeded.
    pub async fn emit(
        &self,
        handle: &ContextHandle,
        agent: &str,
        kind: HookKind,
        detail: Option<String>,
    ) -> bool {
        let args = json!({
            "event": kind.to_string(),
            "agent": agent,
            "record_id": handle.id(),
            "detail": detail,
        });
        let (success, detail) = match self
            .capabilities
            .invoke_capability(&self.capability, args, self.timeout)
            .await
        {
            Ok(_) => {
                debug!(agent, hook = %kind, "Hook fired");
                (true, detail)
            }
            Err(e) => {
                warn!(agent, hook = %kind, error = %e, "Hook failed");
                (false, Some(e.to_string()))
            }
        };
        handle.update(|r| {
            r.hook_events.push(HookEvent {
                agent: agent.to_string(),
                kind,
                success,
                timestamp: Utc::now(),
                detail,
            });
        });
        success
    }
}
