use crate::error::{TaskweaveError, TaskweaveResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome status reported by a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    /// The call succeeded and `data` holds its payload.
    Success,
    /// The call failed and `error` explains why.
    Error,
}

/// The `{status, data|error}` envelope every capability returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Success or error.
    pub status: CapabilityStatus,
    /// Free-form payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityResponse {
    /// Creates a successful response.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: CapabilityStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CapabilityStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Whether the response reports success.
    pub fn is_success(&self) -> bool {
        self.status == CapabilityStatus::Success
    }
}

/// An external capability (host tool, hook, API) the core can call.
///
/// The core only looks at the status of the response; the payload is opaque.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Name the capability is registered under.
    fn name(&self) -> &str;

    /// Invoke the capability with free-form arguments.
    async fn invoke(&self, args: serde_json::Value) -> CapabilityResponse;
}

/// Name-keyed registry of capabilities.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability, replacing any previous one with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        info!(capability = %name, "Registered capability");
        self.capabilities.insert(name, capability);
    }

    /// Look up a capability by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    /// Whether a capability with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Sorted list of registered names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Invoke a capability under a wall-clock timeout.
    ///
    /// Unknown names yield [`TaskweaveError::MissingCapability`], an exceeded
    /// budget yields [`TaskweaveError::Timeout`], and an error envelope yields
    /// [`TaskweaveError::Capability`].
    pub async fn invoke_capability(
        &self,
        name: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> TaskweaveResult<serde_json::Value> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| TaskweaveError::MissingCapability(name.to_string()))?;

        debug!(capability = %name, "Invoking capability");
        let response = tokio::time::timeout(timeout, capability.invoke(args))
            .await
            .map_err(|_| TaskweaveError::timeout(format!("capability '{name}'"), timeout))?;

        match response.status {
            CapabilityStatus::Success => Ok(response.data.unwrap_or(serde_json::Value::Null)),
            CapabilityStatus::Error => {
                let message = response
                    .error
                    .unwrap_or_else(|| "unspecified error".to_string());
                warn!(capability = %name, error = %message, "Capability returned an error");
                Err(TaskweaveError::Capability {
                    name: name.to_string(),
                    message,
                })
            }
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
