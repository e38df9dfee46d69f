//! Range deletion
//!
//! After a committed migration the donor still holds the moved
//! documents; a range deletion removes them, either inline when the
//! caller asked to wait or queued on a background task. Deletes issued
//! here carry the not-in-active-chunk flag so the mod-capture hook
//! never mistakes them for user writes.

use crate::doc::Document;
use crate::error::Result;
use crate::store::CollectionStore;
use async_trait::async_trait;
use serde_json::Value;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// One range deletion request.
#[derive(Debug, Clone)]
pub struct RangeDeletion {
    pub ns: String,
    pub min: Document,
    pub max: Document,
    pub secondary_throttle: bool,
}

#[async_trait]
pub trait RangeDeleter: Send + Sync {
    /// Delete the range inline and return the number of documents
    /// removed.
    async fn delete_now(&self, task: RangeDeletion) -> Result<u64>;

    /// Queue the deletion on a background worker.
    fn queue_delete(&self, task: RangeDeletion) -> Result<()>;

    /// Deletions still outstanding. A recipient refuses new chunks
    /// while deletes from a previous migration are pending.
    fn current_deletes(&self) -> usize;
}

/// Range deleter working directly against the in-memory store.
pub struct StoreRangeDeleter {
    store: Arc<CollectionStore>,
    pending: Arc<AtomicUsize>,
}

impl StoreRangeDeleter {
    pub fn new(store: Arc<CollectionStore>) -> Self {
        StoreRangeDeleter {
            store,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn run(store: &CollectionStore, task: &RangeDeletion) -> Result<u64> {
        let collection = store.collection_or_err(&task.ns)?;
        let removed = collection.remove_range(&task.min, &task.max, false, true, None)?;
        info!(ns = %task.ns, removed, "range deletion finished");
        Ok(removed)
    }
}

#[async_trait]
impl RangeDeleter for StoreRangeDeleter {
    async fn delete_now(&self, task: RangeDeletion) -> Result<u64> {
        Self::run(&self.store, &task)
    }

    fn queue_delete(&self, task: RangeDeletion) -> Result<()> {
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = Self::run(&store, &task) {
                warn!(ns = %task.ns, error = %e, "queued range deletion failed");
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn current_deletes(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Paranoia snapshotter: documents removed by pre-cleanup or
/// catchup-deletes can be saved as JSON lines before removal.
pub struct RemoveSaver {
    path: PathBuf,
    file: Option<File>,
}

impl RemoveSaver {
    pub fn new(root: &Path, op: &str, ns: &str, why: &str) -> Self {
        let path = root.join(format!("{}.{}.{}.jsonl", op, ns, why));
        RemoveSaver { path, file: None }
    }

    /// Append one document. The file is created lazily so untouched
    /// savers leave nothing behind.
    pub fn save(&mut self, doc: &Document) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                create_dir_all(parent)?;
            }
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let file = self.file.as_mut().expect("file opened above");
        writeln!(file, "{}", Value::Object(doc.0.clone()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ShardKeyPattern;
    use crate::store::CollectionOptions;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn seeded_store() -> Arc<CollectionStore> {
        let store = Arc::new(CollectionStore::new());
        let pattern = ShardKeyPattern::parse(&doc(json!({"x": 1}))).unwrap();
        let coll = store
            .create_collection("db.c", CollectionOptions::default(), pattern)
            .unwrap();
        for x in 0..6 {
            coll.upsert(doc(json!({"_id": x, "x": x}))).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_delete_now_removes_range() {
        let store = seeded_store();
        let deleter = StoreRangeDeleter::new(Arc::clone(&store));
        let removed = deleter
            .delete_now(RangeDeletion {
                ns: "db.c".to_string(),
                min: doc(json!({"x": 1})),
                max: doc(json!({"x": 4})),
                secondary_throttle: false,
            })
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.collection("db.c").unwrap().num_records(), 3);
    }

    #[tokio::test]
    async fn test_queue_delete_runs_in_background() {
        let store = seeded_store();
        let deleter = StoreRangeDeleter::new(Arc::clone(&store));
        deleter
            .queue_delete(RangeDeletion {
                ns: "db.c".to_string(),
                min: doc(json!({"x": 0})),
                max: doc(json!({"x": 6})),
                secondary_throttle: false,
            })
            .unwrap();

        for _ in 0..100 {
            if deleter.current_deletes() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(deleter.current_deletes(), 0);
        assert_eq!(store.collection("db.c").unwrap().num_records(), 0);
    }

    #[test]
    fn test_remove_saver_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = RemoveSaver::new(dir.path(), "moveChunk", "db.c", "preCleanup");
        saver.save(&doc(json!({"_id": 1, "x": 1}))).unwrap();
        saver.save(&doc(json!({"_id": 2, "x": 2}))).unwrap();

        let content = std::fs::read_to_string(saver.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"_id\":1"));
    }
}
