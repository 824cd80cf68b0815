use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskweave_context::{ContextStore, FileContextStore};
use taskweave_core::{CapabilityRegistry, TaskweaveError, TaskweaveResult};
use tracing::{info, warn};

/// Outcome of one check. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Warning => write!(f, "WARNING"),
            HealthStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            details: serde_json::Value::Null,
            duration_ms: 0,
        }
    }

    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy, message)
    }

    pub fn warning(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Warning, message)
    }

    pub fn critical(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Critical, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Aggregate of one `run_checks` pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all checks.
    pub overall: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    /// No check is critical.
    pub ready_for_primary: bool,
    /// None of the checks the fallback path depends on is critical.
    pub ready_for_fallback: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Names of the checks that came back critical.
    pub fn critical_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.status == HealthStatus::Critical)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// A single independent readiness check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the fallback path also depends on this check.
    fn required_for_fallback(&self) -> bool {
        false
    }

    /// Errors are reported as a critical result by the monitor.
    async fn check(&self) -> TaskweaveResult<HealthCheckResult>;
}

/// Settings for the standard check set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Capabilities the primary agents need.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Environment variables holding credentials the primary agents need.
    #[serde(default)]
    pub required_credentials: Vec<String>,
    /// Active record count considered full; 0 disables the headroom check.
    #[serde(default = "default_max_active_records")]
    pub max_active_records: usize,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

fn default_max_active_records() -> usize {
    1_000
}

fn default_check_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            required_capabilities: Vec::new(),
            required_credentials: Vec::new(),
            max_active_records: default_max_active_records(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

// ─── Standard checks ────────────────────────────────────────────────────────

/// Every required capability is registered.
pub struct CapabilityCheck {
    capabilities: Arc<CapabilityRegistry>,
    required: Vec<String>,
}

impl CapabilityCheck {
    pub fn new(capabilities: Arc<CapabilityRegistry>, required: Vec<String>) -> Self {
        Self {
            capabilities,
            required,
        }
    }
}

#[async_trait]
impl HealthCheck for CapabilityCheck {
    fn name(&self) -> &str {
        "capabilities"
    }

    async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
        let missing: Vec<&String> = self
            .required
            .iter()
            .filter(|name| !self.capabilities.contains(name))
            .collect();
        let details = json!({
            "required": self.required,
            "registered": self.capabilities.names(),
            "missing": missing,
        });
        let result = if missing.is_empty() {
            HealthCheckResult::healthy(
                self.name(),
                format!("{} required capabilities available", self.required.len()),
            )
        } else {
            HealthCheckResult::critical(
                self.name(),
                format!("{} required capabilities missing", missing.len()),
            )
        };
        Ok(result.with_details(details))
    }
}

/// Every required credential variable is set and non-empty.
pub struct CredentialCheck {
    variables: Vec<String>,
}

impl CredentialCheck {
    pub fn new(variables: Vec<String>) -> Self {
        Self { variables }
    }
}

#[async_trait]
impl HealthCheck for CredentialCheck {
    fn name(&self) -> &str {
        "credentials"
    }

    async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
        let missing: Vec<&String> = self
            .variables
            .iter()
            .filter(|var| {
                std::env::var(var.as_str())
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect();
        let details = json!({ "missing": missing });
        let result = if missing.is_empty() {
            HealthCheckResult::healthy(self.name(), "All credentials configured")
        } else {
            HealthCheckResult::critical(
                self.name(),
                format!("{} credentials not configured", missing.len()),
            )
        };
        Ok(result.with_details(details))
    }
}

/// A probe file can be written to and removed from the storage root.
pub struct StorageWritableCheck {
    dir: PathBuf,
}

impl StorageWritableCheck {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl HealthCheck for StorageWritableCheck {
    fn name(&self) -> &str {
        "storage"
    }

    fn required_for_fallback(&self) -> bool {
        true
    }

    async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
        let probe = self
            .dir
            .join(format!(".health-probe-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(HealthCheckResult::healthy(self.name(), "Storage is writable")
            .with_details(json!({ "dir": self.dir.display().to_string() })))
    }
}

/// The store's active and archived directories exist.
pub struct FilesystemLayoutCheck {
    dirs: Vec<PathBuf>,
}

impl FilesystemLayoutCheck {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn for_store(store: &FileContextStore) -> Self {
        Self::new(vec![
            store.active_dir().to_path_buf(),
            store.archived_dir().to_path_buf(),
        ])
    }
}

#[async_trait]
impl HealthCheck for FilesystemLayoutCheck {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn required_for_fallback(&self) -> bool {
        true
    }

    async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
        let mut missing = Vec::new();
        for dir in &self.dirs {
            let is_dir = tokio::fs::metadata(dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                missing.push(dir.display().to_string());
            }
        }
        let details = json!({ "missing": missing });
        let result = if missing.is_empty() {
            HealthCheckResult::healthy(self.name(), "Store layout intact")
        } else {
            HealthCheckResult::critical(
                self.name(),
                format!("{} store directories missing", missing.len()),
            )
        };
        Ok(result.with_details(details))
    }
}

/// Active record count against a configured ceiling.
pub struct ResourceHeadroomCheck {
    store: Arc<dyn ContextStore>,
    max_active_records: usize,
}

impl ResourceHeadroomCheck {
    pub const WARNING_RATIO: f64 = 0.8;

    pub fn new(store: Arc<dyn ContextStore>, max_active_records: usize) -> Self {
        Self {
            store,
            max_active_records,
        }
    }
}

#[async_trait]
impl HealthCheck for ResourceHeadroomCheck {
    fn name(&self) -> &str {
        "resources"
    }

    async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
        let active = self.store.list_active().await?.len();
        if self.max_active_records == 0 {
            return Ok(
                HealthCheckResult::healthy(self.name(), "No active record limit")
                    .with_details(json!({ "active": active })),
            );
        }
        let ratio = active as f64 / self.max_active_records as f64;
        let details = json!({
            "active": active,
            "max_active_records": self.max_active_records,
            "ratio": ratio,
        });
        let message = format!("{active}/{} active records", self.max_active_records);
        let result = if ratio >= 1.0 {
            HealthCheckResult::critical(self.name(), message)
        } else if ratio >= Self::WARNING_RATIO {
            HealthCheckResult::warning(self.name(), message)
        } else {
            HealthCheckResult::healthy(self.name(), message)
        };
        Ok(result.with_details(details))
    }
}

// ─── Monitor ────────────────────────────────────────────────────────────────

/// Runs an ordered set of independent checks.
pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    check_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            check_timeout,
        }
    }

    /// The standard checks for a file-backed store, in fixed order.
    pub fn standard(
        config: &HealthConfig,
        store: Arc<FileContextStore>,
        capabilities: Arc<CapabilityRegistry>,
    ) -> Self {
        let mut monitor = Self::new(Duration::from_millis(config.check_timeout_ms));
        monitor.add_check(Arc::new(CapabilityCheck::new(
            capabilities,
            config.required_capabilities.clone(),
        )));
        monitor.add_check(Arc::new(CredentialCheck::new(
            config.required_credentials.clone(),
        )));
        monitor.add_check(Arc::new(StorageWritableCheck::new(store.active_dir())));
        monitor.add_check(Arc::new(FilesystemLayoutCheck::for_store(&store)));
        monitor.add_check(Arc::new(ResourceHeadroomCheck::new(
            store,
            config.max_active_records,
        )));
        monitor
    }

    pub fn add_check(&mut self, check: Arc<dyn HealthCheck>) {
        self.checks.push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check in order. Never short-circuits: a check that errors,
    /// panics or times out is reported as critical and the rest still run.
    pub async fn run_checks(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(self.checks.len());
        let mut ready_for_fallback = true;

        for check in &self.checks {
            let name = check.name().to_string();
            let start = Instant::now();
            let outcome = tokio::time::timeout(
                self.check_timeout,
                AssertUnwindSafe(check.check()).catch_unwind(),
            )
            .await;

            let mut result = match outcome {
                Ok(Ok(Ok(mut result))) => {
                    result.name = name.clone();
                    result
                }
                Ok(Ok(Err(e))) => {
                    warn!(check = %name, error = %e, "Health check failed");
                    HealthCheckResult::critical(&name, e.to_string())
                }
                Ok(Err(_panic)) => {
                    warn!(check = %name, "Health check panicked");
                    HealthCheckResult::critical(&name, "check panicked")
                }
                Err(_) => {
                    let err = TaskweaveError::timeout(
                        format!("health check '{name}'"),
                        self.check_timeout,
                    );
                    warn!(check = %name, error = %err, "Health check timed out");
                    HealthCheckResult::critical(&name, err.to_string())
                }
            };
            result.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            if check.required_for_fallback() && result.status == HealthStatus::Critical {
                ready_for_fallback = false;
            }
            checks.push(result);
        }

        let overall = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let report = HealthReport {
            overall,
            ready_for_primary: overall != HealthStatus::Critical,
            ready_for_fallback,
            checks,
            checked_at: Utc::now(),
        };
        info!(
            overall = %report.overall,
            ready_for_primary = report.ready_for_primary,
            ready_for_fallback = report.ready_for_fallback,
            "Health checks complete"
        );
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskweave_context::RecordMetadata;
    use tempfile::TempDir;

    struct Fixed(&'static str, HealthStatus);

    #[async_trait]
    impl HealthCheck for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
            Ok(HealthCheckResult::new("ignored", self.1, "fixed"))
        }
    }

    struct Panics;

    #[async_trait]
    impl HealthCheck for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
            panic!("probe exploded");
        }
    }

    struct Errors;

    #[async_trait]
    impl HealthCheck for Errors {
        fn name(&self) -> &str {
            "errors"
        }

        fn required_for_fallback(&self) -> bool {
            true
        }

        async fn check(&self) -> TaskweaveResult<HealthCheckResult> {
            Err(TaskweaveError::Storage("disk gone".into()))
        }
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Critical > HealthStatus::Warning);
        assert!(HealthStatus::Warning > HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_run_checks_never_short_circuits() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.add_check(Arc::new(Panics));
        monitor.add_check(Arc::new(Fixed("ok", HealthStatus::Healthy)));
        monitor.add_check(Arc::new(Fixed("meh", HealthStatus::Warning)));

        let report = monitor.run_checks().await;
        assert_eq!(report.checks.len(), 3);
        assert_eq!(report.checks[0].status, HealthStatus::Critical);
        assert_eq!(report.checks[1].name, "ok");
        assert_eq!(report.overall, HealthStatus::Critical);
        assert!(!report.ready_for_primary);
        assert!(report.ready_for_fallback);
        assert_eq!(report.critical_checks(), vec!["panics"]);
    }

    #[tokio::test]
    async fn test_errors_in_fallback_checks_block_fallback() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.add_check(Arc::new(Errors));
        let report = monitor.run_checks().await;
        assert!(!report.ready_for_primary);
        assert!(!report.ready_for_fallback);
        assert!(report.checks[0].message.contains("disk gone"));
    }

    #[tokio::test]
    async fn test_warning_keeps_primary_ready() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.add_check(Arc::new(Fixed("meh", HealthStatus::Warning)));
        let report = monitor.run_checks().await;
        assert_eq!(report.overall, HealthStatus::Warning);
        assert!(report.ready_for_primary);
    }

    #[tokio::test]
    async fn test_standard_checks_on_fresh_store() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileContextStore::new(tmp.path()).await.unwrap());
        let config = HealthConfig {
            required_capabilities: vec!["web_search".into()],
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::standard(&config, store, Arc::new(CapabilityRegistry::new()));
        assert_eq!(monitor.len(), 5);

        let report = monitor.run_checks().await;
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["capabilities", "credentials", "storage", "filesystem", "resources"]
        );
        assert_eq!(
            report.check("capabilities").unwrap().status,
            HealthStatus::Critical
        );
        assert!(!report.ready_for_primary);
        assert!(report.ready_for_fallback);
    }

    #[tokio::test]
    async fn test_missing_layout_is_critical() {
        let tmp = TempDir::new().unwrap();
        let store = FileContextStore::new(tmp.path()).await.unwrap();
        std::fs::remove_dir_all(store.archived_dir()).unwrap();
        let result = FilesystemLayoutCheck::for_store(&store).check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_resource_headroom_thresholds() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ContextStore> =
            Arc::new(FileContextStore::new(tmp.path()).await.unwrap());
        for i in 0..4 {
            store
                .create(&format!("task {i}"), RecordMetadata::default())
                .await
                .unwrap();
        }

        let status = |max| {
            let check = ResourceHeadroomCheck::new(store.clone(), max);
            async move { check.check().await.unwrap().status }
        };
        assert_eq!(status(10).await, HealthStatus::Healthy);
        assert_eq!(status(5).await, HealthStatus::Warning);
        assert_eq!(status(4).await, HealthStatus::Critical);
        assert_eq!(status(0).await, HealthStatus::Healthy);
    }
}
