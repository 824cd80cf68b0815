use crate::record::ContextRecord;
use crate::store::ContextStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_core::TaskweaveResult;
use uuid::Uuid;

/// One async save lock per record id.
///
/// Every [`ContextHandle`] for the same id shares the same lock, so saves for
/// one record are applied strictly one after another.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    /// Drop locks nobody else holds a reference to.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// In-memory record shared by every agent of a run.
///
/// All reads and writes go through the record mutex, so concurrent agents
/// never lose each other's artifact writes. Saves additionally take the
/// per-id lock from [`RecordLocks`].
pub struct ContextHandle {
    id: Uuid,
    record: Mutex<ContextRecord>,
    store: Arc<dyn ContextStore>,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ContextHandle {
    pub fn new(
        record: ContextRecord,
        store: Arc<dyn ContextStore>,
        save_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            id: record.id,
            record: Mutex::new(record),
            store,
            save_lock,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Clone of the current in-memory state.
    pub fn snapshot(&self) -> ContextRecord {
        self.record.lock().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ContextRecord) -> R) -> R {
        f(&self.record.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ContextRecord) -> R) -> R {
        f(&mut self.record.lock())
    }

    pub fn task(&self) -> String {
        self.read(|r| r.task.clone())
    }

    pub fn artifact(&self, key: &str) -> Option<serde_json::Value> {
        self.read(|r| r.artifact(key).cloned())
    }

    pub fn set_artifact(&self, key: impl Into<String>, value: serde_json::Value) {
        self.update(|r| r.set_artifact(key, value));
    }

    pub fn version(&self) -> u64 {
        self.read(|r| r.version)
    }

    /// Persist the current state and return the new version.
    ///
    /// Only `version` and `updated_at` are written back, so mutations made
    /// by other agents while the write is in flight are kept.
    pub async fn save(&self) -> TaskweaveResult<u64> {
        let _guard = self.save_lock.lock().await;
        let mut snapshot = self.snapshot();
        self.store.save(&mut snapshot).await?;
        self.update(|r| {
            r.version = snapshot.version;
            r.updated_at = snapshot.updated_at;
        });
        Ok(snapshot.version)
    }
}
