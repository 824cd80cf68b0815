//! `taskweave.toml` loading and validation.
//!
//! Every section is optional; missing keys fall back to the same defaults the
//! library crates use.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use taskweave_agent::{AdapterConfig, FallbackConfig};
use taskweave_orchestrator::{EngineConfig, HealthConfig};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct TaskweaveConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// TTL applied to new records created without an explicit one.
    #[serde(default)]
    pub default_ttl_hours: Option<u64>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for TaskweaveConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            adapter: AdapterConfig::default(),
            fallback: FallbackConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl TaskweaveConfig {
    /// Read and parse `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: TaskweaveConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// Resolve a relative `data_dir` against the directory holding the config file.
    pub fn resolve_data_dir(&mut self, config_path: &Path) {
        if self.data_dir.is_relative() {
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                self.data_dir = parent.join(&self.data_dir);
            }
        }
    }

    /// Semantic problems that parsing alone does not catch.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.data_dir.as_os_str().is_empty() {
            problems.push("data_dir must not be empty".to_string());
        }
        if self.engine.max_parallel == 0 {
            problems.push("engine.max_parallel must be at least 1".to_string());
        }
        if self.adapter.max_attempts == 0 {
            problems.push("adapter.max_attempts must be at least 1".to_string());
        }
        if self.adapter.backoff_base_ms > self.adapter.backoff_max_ms {
            problems.push(format!(
                "adapter.backoff_base_ms ({}) exceeds adapter.backoff_max_ms ({})",
                self.adapter.backoff_base_ms, self.adapter.backoff_max_ms
            ));
        }
        if self.adapter.agent_timeout_ms == 0 {
            problems.push("adapter.agent_timeout_ms must be positive".to_string());
        }
        if self.adapter.capability_timeout_ms == 0 {
            problems.push("adapter.capability_timeout_ms must be positive".to_string());
        }
        if self.fallback.max_artifact_bytes == 0 {
            problems.push("fallback.max_artifact_bytes must be positive".to_string());
        }
        if self.health.check_timeout_ms == 0 {
            problems.push("health.check_timeout_ms must be positive".to_string());
        }
        problems
    }
}
