use crate::filter::RecordFilter;
use crate::record::{ContextRecord, Priority, RecordMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use taskweave_core::{FailureReason, TaskweaveError, TaskweaveResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which of the two logical locations holds a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLocation {
    Active,
    Archived,
}

/// Outcome of a TTL sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Active records found past their TTL.
    pub expired: Vec<Uuid>,
    /// Records actually moved to the archive (empty on a dry run).
    pub archived: Vec<Uuid>,
}

/// Aggregate counts over every persisted record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub active: usize,
    pub archived: usize,
    /// Active records already past their TTL.
    pub expired: usize,
    /// Records with at least one failed agent.
    pub failed: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub fallbacks_by_reason: BTreeMap<FailureReason, usize>,
}

/// Persistence and lifecycle for context records.
///
/// Implementations do not serialize concurrent saves of the same id; callers
/// hold a per-id lock (see [`crate::RecordLocks`]).
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Create and persist a fresh record at version 1.
    async fn create(&self, task: &str, metadata: RecordMetadata) -> TaskweaveResult<ContextRecord>;

    /// Load a record, looking in the active location first.
    async fn get(&self, id: Uuid) -> TaskweaveResult<ContextRecord>;

    /// Where a record currently lives, if anywhere.
    async fn location(&self, id: Uuid) -> TaskweaveResult<Option<RecordLocation>>;

    /// Persist the full snapshot, bumping `version` by one and advancing
    /// `updated_at`. The record is only modified when the write succeeds.
    async fn save(&self, record: &mut ContextRecord) -> TaskweaveResult<()>;

    /// Move a record to the archive. Archiving twice is a no-op.
    async fn archive(&self, id: Uuid) -> TaskweaveResult<ContextRecord>;

    /// Archive (`permanent = false`) or irreversibly remove every copy.
    async fn delete(&self, id: Uuid, permanent: bool) -> TaskweaveResult<()>;

    async fn list_active(&self) -> TaskweaveResult<Vec<ContextRecord>>;

    async fn list_archived(&self, filter: &RecordFilter) -> TaskweaveResult<Vec<ContextRecord>>;

    /// Filtered scan over both locations.
    async fn search(&self, filter: &RecordFilter) -> TaskweaveResult<Vec<ContextRecord>>;

    /// Archive every active record past its TTL, or only report them on a dry run.
    async fn cleanup_expired(&self, dry_run: bool) -> TaskweaveResult<CleanupReport> {
        self.cleanup_expired_at(dry_run, Utc::now()).await
    }

    /// [`ContextStore::cleanup_expired`] evaluated at an explicit instant.
    async fn cleanup_expired_at(
        &self,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> TaskweaveResult<CleanupReport> {
        let mut report = CleanupReport {
            dry_run,
            ..CleanupReport::default()
        };
        for record in self.list_active().await? {
            if !record.is_expired_at(now) {
                continue;
            }
            report.expired.push(record.id);
            if dry_run {
                continue;
            }
            match self.archive(record.id).await {
                Ok(_) => report.archived.push(record.id),
                // Archived or deleted concurrently.
                Err(TaskweaveError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(
            expired = report.expired.len(),
            archived = report.archived.len(),
            dry_run,
            "TTL cleanup finished"
        );
        Ok(report)
    }

    async fn stats(&self) -> TaskweaveResult<StoreStats> {
        let now = Utc::now();
        let active = self.list_active().await?;
        let archived = self.list_archived(&RecordFilter::default()).await?;

        let mut stats = StoreStats {
            active: active.len(),
            archived: archived.len(),
            expired: active.iter().filter(|r| r.is_expired_at(now)).count(),
            ..StoreStats::default()
        };
        for record in active.iter().chain(archived.iter()) {
            if record.has_failed_agent() {
                stats.failed += 1;
            }
            *stats.by_priority.entry(record.priority).or_default() += 1;
            for entry in &record.fallback_log {
                *stats.fallbacks_by_reason.entry(entry.reason).or_default() += 1;
            }
        }
        Ok(stats)
    }
}

/// File-based store: one pretty-printed JSON snapshot per record under
/// `<root>/active/` or `<root>/archived/`.
///
/// Every query is a linear directory scan; fine for low thousands of records.
pub struct FileContextStore {
    root: PathBuf,
    active_dir: PathBuf,
    archived_dir: PathBuf,
}

impl FileContextStore {
    pub async fn new(root: impl Into<PathBuf>) -> TaskweaveResult<Self> {
        let root = root.into();
        let active_dir = root.join("active");
        let archived_dir = root.join("archived");
        for dir in [&active_dir, &archived_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| storage_error("create directory", dir, e))?;
        }
        Ok(Self {
            root,
            active_dir,
            archived_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_dir(&self) -> &Path {
        &self.active_dir
    }

    pub fn archived_dir(&self) -> &Path {
        &self.archived_dir
    }

    fn active_path(&self, id: Uuid) -> PathBuf {
        self.active_dir.join(format!("{id}.json"))
    }

    fn archived_path(&self, id: Uuid) -> PathBuf {
        self.archived_dir.join(format!("{id}.json"))
    }

    async fn read_record(&self, path: &Path) -> TaskweaveResult<ContextRecord> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| storage_error("read", path, e))?;
        serde_json::from_str(&data).map_err(|e| TaskweaveError::CorruptRecord {
            id: path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            reason: e.to_string(),
        })
    }

    /// Read a record from `location`, following it into the archive when
    /// it was moved after the location was looked up.
    async fn read_at(
        &self,
        id: Uuid,
        location: RecordLocation,
    ) -> TaskweaveResult<ContextRecord> {
        if location == RecordLocation::Active {
            if let Some(record) = self.read_if_present(&self.active_path(id)).await? {
                return Ok(record);
            }
        }
        self.read_if_present(&self.archived_path(id))
            .await?
            .ok_or(TaskweaveError::NotFound(id))
    }

    async fn read_if_present(&self, path: &Path) -> TaskweaveResult<Option<ContextRecord>> {
        match self.read_record(path).await {
            Ok(record) => Ok(Some(record)),
            Err(TaskweaveError::Storage(message)) => {
                if exists(path).await? {
                    Err(TaskweaveError::Storage(message))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write to a uniquely named temp file, then rename over the target.
    async fn write_atomic(&self, path: &Path, record: &ContextRecord) -> TaskweaveResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| storage_error("write", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(storage_error("rename", path, e));
        }
        Ok(())
    }

    async fn already_archived(&self, id: Uuid) -> TaskweaveResult<ContextRecord> {
        let archived_path = self.archived_path(id);
        if exists(&archived_path).await? {
            debug!(record_id = %id, "Record already archived");
            return self.read_record(&archived_path).await;
        }
        Err(TaskweaveError::NotFound(id))
    }

    async fn scan(&self, dir: &Path) -> TaskweaveResult<Vec<ContextRecord>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| storage_error("list", dir, e))?;
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("list", dir, e))?
        {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .is_some_and(|stem| Uuid::parse_str(stem).is_ok());
            if !is_snapshot {
                continue;
            }
            match self.read_record(&path).await {
                Ok(record) => records.push(record),
                Err(TaskweaveError::CorruptRecord { id, reason }) => {
                    warn!(record_id = %id, error = %reason, "Skipping corrupt record during scan");
                }
                Err(TaskweaveError::Storage(message)) => {
                    // Removed between read_dir and read.
                    if exists(&path).await? {
                        return Err(TaskweaveError::Storage(message));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn create(&self, task: &str, metadata: RecordMetadata) -> TaskweaveResult<ContextRecord> {
        let record = ContextRecord::new(task, metadata);
        self.write_atomic(&self.active_path(record.id), &record)
            .await?;
        info!(record_id = %record.id, priority = %record.priority, "Created context record");
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> TaskweaveResult<ContextRecord> {
        match self.location(id).await? {
            Some(location) => self.read_at(id, location).await,
            None => Err(TaskweaveError::NotFound(id)),
        }
    }

    async fn location(&self, id: Uuid) -> TaskweaveResult<Option<RecordLocation>> {
        if exists(&self.active_path(id)).await? {
            Ok(Some(RecordLocation::Active))
        } else if exists(&self.archived_path(id)).await? {
            Ok(Some(RecordLocation::Archived))
        } else {
            Ok(None)
        }
    }

    async fn save(&self, record: &mut ContextRecord) -> TaskweaveResult<()> {
        if record.is_archived()
            || self.location(record.id).await? == Some(RecordLocation::Archived)
        {
            return Err(TaskweaveError::ReadOnly(record.id));
        }

        let mut snapshot = record.clone();
        snapshot.version += 1;
        snapshot.updated_at = advance(record.updated_at);
        self.write_atomic(&self.active_path(record.id), &snapshot)
            .await?;

        record.version = snapshot.version;
        record.updated_at = snapshot.updated_at;
        debug!(record_id = %record.id, version = record.version, "Saved context record");
        Ok(())
    }

    async fn archive(&self, id: Uuid) -> TaskweaveResult<ContextRecord> {
        let active_path = self.active_path(id);
        if !exists(&active_path).await? {
            return self.already_archived(id).await;
        }

        let mut record = match self.read_record(&active_path).await {
            Ok(record) => record,
            Err(TaskweaveError::Storage(message)) => {
                // Another archiver moved it after the existence check.
                if exists(&active_path).await? {
                    return Err(TaskweaveError::Storage(message));
                }
                return self.already_archived(id).await;
            }
            Err(e) => return Err(e),
        };
        let now = advance(record.updated_at);
        record.archived_at = Some(now);
        record.updated_at = now;
        record.version += 1;
        self.write_atomic(&self.archived_path(id), &record).await?;
        match tokio::fs::remove_file(&active_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error("remove", &active_path, e)),
        }
        info!(record_id = %id, "Archived context record");
        Ok(record)
    }

    async fn delete(&self, id: Uuid, permanent: bool) -> TaskweaveResult<()> {
        if !permanent {
            return self.archive(id).await.map(|_| ());
        }

        let mut removed = false;
        for path in [self.active_path(id), self.archived_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(storage_error("remove", &path, e)),
            }
        }
        if !removed {
            return Err(TaskweaveError::NotFound(id));
        }
        warn!(record_id = %id, "Permanently deleted context record");
        Ok(())
    }

    async fn list_active(&self) -> TaskweaveResult<Vec<ContextRecord>> {
        self.scan(&self.active_dir).await
    }

    async fn list_archived(&self, filter: &RecordFilter) -> TaskweaveResult<Vec<ContextRecord>> {
        let mut records = self.scan(&self.archived_dir).await?;
        records.retain(|r| filter.matches(r));
        Ok(records)
    }

    async fn search(&self, filter: &RecordFilter) -> TaskweaveResult<Vec<ContextRecord>> {
        let mut records = self.scan(&self.active_dir).await?;
        records.extend(self.scan(&self.archived_dir).await?);
        records.retain(|r| filter.matches(r));
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

/// A timestamp strictly after `previous`, normally `Utc::now()`.
fn advance(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

async fn exists(path: &Path) -> TaskweaveResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| storage_error("stat", path, e))
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> TaskweaveError {
    TaskweaveError::Storage(format!("failed to {action} {}: {err}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{FallbackRecord, RecordStatus};
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileContextStore) {
        let tmp = TempDir::new().unwrap();
        let store = FileContextStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_tmp, store) = store().await;
        let record = store
            .create("Parse the PDF", RecordMetadata::default())
            .await
            .unwrap();
        assert_eq!(record.version, 1);

        let loaded = store.get(record.id).await.unwrap();
        assert_eq!(loaded, record);
        assert_eq!(
            store.location(record.id).await.unwrap(),
            Some(RecordLocation::Active)
        );
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_tmp, store) = store().await;
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get(id).await,
            Err(TaskweaveError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_save_bumps_version_and_updated_at() {
        let (_tmp, store) = store().await;
        let mut record = store.create("t", RecordMetadata::default()).await.unwrap();

        for expected in 2..=4 {
            let before = record.updated_at;
            record.set_artifact("step", json!(expected));
            store.save(&mut record).await.unwrap();
            assert_eq!(record.version, expected);
            assert!(record.updated_at > before);
        }

        let loaded = store.get(record.id).await.unwrap();
        assert_eq!(loaded.version, 4);
        assert_eq!(loaded.artifact("step"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_surfaces() {
        let (_tmp, store) = store().await;
        let record = store.create("t", RecordMetadata::default()).await.unwrap();
        tokio::fs::write(store.active_path(record.id), "{ not json")
            .await
            .unwrap();

        let err = store.get(record.id).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::CorruptRecord { .. }));
        // Never repaired: the bad bytes are still there.
        let raw = tokio::fs::read_to_string(store.active_path(record.id))
            .await
            .unwrap();
        assert_eq!(raw, "{ not json");
        // Scans skip it rather than failing.
        assert!(store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_is_idempotent() {
        let (_tmp, store) = store().await;
        let record = store.create("t", RecordMetadata::default()).await.unwrap();

        let first = store.archive(record.id).await.unwrap();
        let second = store.archive(record.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.version, 2);
        assert!(first.archived_at.is_some());
        assert_eq!(
            store.location(record.id).await.unwrap(),
            Some(RecordLocation::Archived)
        );
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(
            store
                .list_archived(&RecordFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_archived_records_are_read_only() {
        let (_tmp, store) = store().await;
        let mut record = store.create("t", RecordMetadata::default()).await.unwrap();
        store.archive(record.id).await.unwrap();

        let err = store.save(&mut record).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::ReadOnly(_)));
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_delete_soft_and_permanent() {
        let (_tmp, store) = store().await;
        let a = store.create("a", RecordMetadata::default()).await.unwrap();
        let b = store.create("b", RecordMetadata::default()).await.unwrap();

        store.delete(a.id, false).await.unwrap();
        assert_eq!(
            store.location(a.id).await.unwrap(),
            Some(RecordLocation::Archived)
        );

        store.delete(b.id, true).await.unwrap();
        assert_eq!(store.location(b.id).await.unwrap(), None);
        store.delete(a.id, true).await.unwrap();
        assert_eq!(store.location(a.id).await.unwrap(), None);

        assert!(matches!(
            store.delete(a.id, true).await,
            Err(TaskweaveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_search_spans_both_locations() {
        let (_tmp, store) = store().await;
        let a = store
            .create(
                "Transcribe interview",
                RecordMetadata::default().with_tags(["audio"]),
            )
            .await
            .unwrap();
        store
            .create(
                "Edit wiki page",
                RecordMetadata::default()
                    .with_tags(["wiki"])
                    .with_priority(Priority::High),
            )
            .await
            .unwrap();
        store.archive(a.id).await.unwrap();

        let found = store
            .search(&RecordFilter::new().tag("audio").tag("video"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        let high = store
            .search(&RecordFilter::new().priority(Priority::High))
            .await
            .unwrap();
        assert_eq!(high.len(), 1);

        let archived_active = store
            .list_archived(&RecordFilter::new().status(RecordStatus::Active))
            .await
            .unwrap();
        assert_eq!(archived_active.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (_tmp, store) = store().await;
        let mut old = store
            .create("old", RecordMetadata::default().with_ttl_hours(1))
            .await
            .unwrap();
        old.created_at = Utc::now() - Duration::hours(2);
        store.save(&mut old).await.unwrap();
        let forever = store
            .create("forever", RecordMetadata::default().with_ttl_hours(0))
            .await
            .unwrap();
        let fresh = store
            .create("fresh", RecordMetadata::default().with_ttl_hours(1))
            .await
            .unwrap();

        let dry = store.cleanup_expired(true).await.unwrap();
        assert_eq!(dry.expired, vec![old.id]);
        assert!(dry.archived.is_empty());
        assert_eq!(
            store.location(old.id).await.unwrap(),
            Some(RecordLocation::Active)
        );

        let report = store.cleanup_expired(false).await.unwrap();
        assert_eq!(report.archived, vec![old.id]);
        assert_eq!(
            store.location(old.id).await.unwrap(),
            Some(RecordLocation::Archived)
        );
        for id in [forever.id, fresh.id] {
            assert_eq!(
                store.location(id).await.unwrap(),
                Some(RecordLocation::Active)
            );
        }

        // A second sweep finds nothing.
        assert!(store.cleanup_expired(false).await.unwrap().expired.is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_tmp, store) = store().await;
        let mut failed = store
            .create("x", RecordMetadata::default().with_priority(Priority::High))
            .await
            .unwrap();
        failed.mark_agent_failed("coder", "boom");
        failed.fallback_log.push(FallbackRecord {
            agent: "coder".into(),
            reason: FailureReason::Timeout,
            fallback_target: "coder-remote".into(),
            success: false,
            timestamp: Utc::now(),
            message: String::new(),
        });
        store.save(&mut failed).await.unwrap();
        let done = store.create("y", RecordMetadata::default()).await.unwrap();
        store.archive(done.id).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_priority.get(&Priority::High), Some(&1));
        assert_eq!(stats.by_priority.get(&Priority::Normal), Some(&1));
        assert_eq!(
            stats.fallbacks_by_reason.get(&FailureReason::Timeout),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_read_follows_record_archived_after_lookup() {
        let (_tmp, store) = store().await;
        let record = store.create("moving", RecordMetadata::default()).await.unwrap();
        assert_eq!(
            store.location(record.id).await.unwrap(),
            Some(RecordLocation::Active)
        );

        // A sweep archives the record between the lookup and the read.
        store.archive(record.id).await.unwrap();

        let read = store
            .read_at(record.id, RecordLocation::Active)
            .await
            .unwrap();
        assert!(read.is_archived());
        assert_eq!(read.version, record.version + 1);

        store.delete(record.id, true).await.unwrap();
        let err = store
            .read_at(record.id, RecordLocation::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskweaveError::NotFound(_)));
    }
}
