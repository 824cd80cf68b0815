use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry, timeout and hook settings applied by the agent adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Attempts per execution, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap for the exponential backoff.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Wall-clock budget for one `process` call.
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// Wall-clock budget for one capability invocation.
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    /// Capability invoked on lifecycle events; hooks are off when unset.
    #[serde(default)]
    pub hook_capability: Option<String>,
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_agent_timeout_ms() -> u64 {
    300_000
}

fn default_capability_timeout_ms() -> u64 {
    60_000
}

fn default_hook_timeout_ms() -> u64 {
    10_000
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            agent_timeout_ms: default_agent_timeout_ms(),
            capability_timeout_ms: default_capability_timeout_ms(),
            hook_capability: None,
            hook_timeout_ms: default_hook_timeout_ms(),
        }
    }
}

impl AdapterConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_hook_capability(mut self, name: impl Into<String>) -> Self {
        self.hook_capability = Some(name.into());
        self
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

/// Computes the delay after the given zero-based failed attempt:
/// `backoff_base_ms * 2^attempt`, capped at `backoff_max_ms`.
pub fn compute_backoff(config: &AdapterConfig, attempt: u32) -> u64 {
    let delay = config
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(config.backoff_max_ms)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AdapterConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert_eq!(config.agent_timeout(), Duration::from_secs(300));
        assert!(config.hook_capability.is_none());
    }

    #[test]
    fn test_backoff_is_power_of_two_seconds() {
        let config = AdapterConfig::default();
        assert_eq!(compute_backoff(&config, 0), 1_000);
        assert_eq!(compute_backoff(&config, 1), 2_000);
        assert_eq!(compute_backoff(&config, 2), 4_000);
        assert_eq!(compute_backoff(&config, 10), 60_000);
        assert_eq!(compute_backoff(&config, 200), 60_000);
    }

    #[test]
    fn test_huge_agent_timeout_saturates() {
        let config = AdapterConfig::default().with_agent_timeout(Duration::MAX);
        assert_eq!(config.agent_timeout_ms, u64::MAX);

        let config = AdapterConfig::default().with_agent_timeout(Duration::from_millis(1_500));
        assert_eq!(config.agent_timeout_ms, 1_500);
    }
}
