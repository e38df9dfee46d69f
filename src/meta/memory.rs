//! In-memory metadata authority

use super::{
    ChangeLogEntry, ChunkRecord, CollectionRecord, MetaError, MetaStore, MetaUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Fault injected into the next `apply_updates` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaFault {
    /// Authority unreachable before the update was sent; guaranteed
    /// not applied.
    Unreachable,
    /// The call reports an unknown outcome but the update did land.
    UnknownApplied,
    /// The call reports an unknown outcome and the update was lost.
    UnknownDropped,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, CollectionRecord>,
    chunks: HashMap<String, ChunkRecord>,
    change_log: Vec<ChangeLogEntry>,
    fail_next_apply: Option<MetaFault>,
}

/// Metadata store living in process memory, shared by every shard
/// runtime of a test cluster.
pub struct MemMetaStore {
    inner: Mutex<Inner>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        MemMetaStore {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn put_collection(&self, record: CollectionRecord) {
        self.inner
            .lock()
            .collections
            .insert(record.ns.clone(), record);
    }

    pub fn put_chunk(&self, record: ChunkRecord) {
        self.inner.lock().chunks.insert(record.id.clone(), record);
    }

    /// Arrange for the next `apply_updates` call to fail.
    pub fn fail_next_apply(&self, fault: MetaFault) {
        self.inner.lock().fail_next_apply = Some(fault);
    }

    pub fn change_log(&self) -> Vec<ChangeLogEntry> {
        self.inner.lock().change_log.clone()
    }

    pub fn chunks_for(&self, ns: &str) -> Vec<ChunkRecord> {
        self.inner
            .lock()
            .chunks
            .values()
            .filter(|c| c.ns == ns)
            .cloned()
            .collect()
    }

    fn latest(inner: &Inner, ns: &str) -> Option<ChunkRecord> {
        inner
            .chunks
            .values()
            .filter(|c| c.ns == ns)
            .max_by_key(|c| c.lastmod.to_u64())
            .cloned()
    }
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn collection(&self, ns: &str) -> Result<Option<CollectionRecord>, MetaError> {
        Ok(self.inner.lock().collections.get(ns).cloned())
    }

    async fn linked_collections(&self, ns: &str) -> Result<Vec<String>, MetaError> {
        Ok(self
            .inner
            .lock()
            .collections
            .values()
            .filter(|c| c.linked.as_deref() == Some(ns))
            .map(|c| c.ns.clone())
            .collect())
    }

    async fn chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, MetaError> {
        Ok(self.inner.lock().chunks.get(id).cloned())
    }

    async fn latest_chunk(&self, ns: &str) -> Result<Option<ChunkRecord>, MetaError> {
        Ok(Self::latest(&self.inner.lock(), ns))
    }

    async fn shard_chunks(&self, ns: &str, shard: &str) -> Result<Vec<ChunkRecord>, MetaError> {
        Ok(self
            .inner
            .lock()
            .chunks
            .values()
            .filter(|c| c.ns == ns && c.shard == shard)
            .cloned()
            .collect())
    }

    async fn apply_updates(&self, batch: MetaUpdate) -> Result<(), MetaError> {
        let mut inner = self.inner.lock();

        if let Some(fault) = inner.fail_next_apply.take() {
            match fault {
                MetaFault::Unreachable => {
                    return Err(MetaError::Unreachable("injected".to_string()));
                }
                MetaFault::UnknownApplied => {
                    Self::apply(&mut inner, &batch)?;
                    return Err(MetaError::Unknown("injected after apply".to_string()));
                }
                MetaFault::UnknownDropped => {
                    return Err(MetaError::Unknown("injected before apply".to_string()));
                }
            }
        }

        Self::apply(&mut inner, &batch)
    }

    async fn log_change(
        &self,
        server: &str,
        what: &str,
        ns: &str,
        details: Value,
    ) -> Result<(), MetaError> {
        debug!(server, what, ns, "change log entry");
        self.inner.lock().change_log.push(ChangeLogEntry {
            time: Utc::now(),
            server: server.to_string(),
            what: what.to_string(),
            ns: ns.to_string(),
            details,
        });
        Ok(())
    }
}

impl MemMetaStore {
    fn apply(inner: &mut Inner, batch: &MetaUpdate) -> Result<(), MetaError> {
        let latest = Self::latest(inner, &batch.pre_condition.ns);
        let holds = latest
            .map(|c| {
                c.lastmod
                    .is_equivalent_to(&batch.pre_condition.expected_lastmod)
            })
            .unwrap_or(false);
        if !holds {
            return Err(MetaError::PreconditionFailed);
        }
        for update in &batch.updates {
            inner.chunks.insert(update.id.clone(), update.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Document;
    use crate::meta::{gen_chunk_id, PreCondition};
    use crate::version::{ChunkVersion, Epoch};
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn chunk(ns: &str, min: i64, max: i64, shard: &str, version: ChunkVersion) -> ChunkRecord {
        let min = doc(json!({"x": min}));
        ChunkRecord {
            id: gen_chunk_id(ns, &min),
            ns: ns.to_string(),
            min,
            max: doc(json!({"x": max})),
            shard: shard.to_string(),
            lastmod: version,
        }
    }

    #[tokio::test]
    async fn test_latest_chunk_orders_by_lastmod() {
        let store = MemMetaStore::new();
        let epoch = Epoch::new();
        store.put_chunk(chunk("db.c", 0, 5, "a", ChunkVersion::new(1, 1, epoch)));
        store.put_chunk(chunk("db.c", 5, 10, "b", ChunkVersion::new(2, 0, epoch)));

        let latest = store.latest_chunk("db.c").await.unwrap().unwrap();
        assert_eq!(latest.shard, "b");
    }

    #[tokio::test]
    async fn test_apply_honors_precondition() {
        let store = MemMetaStore::new();
        let epoch = Epoch::new();
        let current = ChunkVersion::new(2, 0, epoch);
        store.put_chunk(chunk("db.c", 0, 5, "a", current));

        let mut moved = chunk("db.c", 0, 5, "b", ChunkVersion::new(3, 0, epoch));
        moved.lastmod = ChunkVersion::new(3, 0, epoch);

        // stale precondition rejected
        let stale = MetaUpdate {
            updates: vec![moved.clone()],
            pre_condition: PreCondition {
                ns: "db.c".to_string(),
                expected_lastmod: ChunkVersion::new(1, 0, epoch),
            },
        };
        assert!(matches!(
            store.apply_updates(stale).await,
            Err(MetaError::PreconditionFailed)
        ));

        // matching precondition applies
        let good = MetaUpdate {
            updates: vec![moved],
            pre_condition: PreCondition {
                ns: "db.c".to_string(),
                expected_lastmod: current,
            },
        };
        store.apply_updates(good).await.unwrap();
        let latest = store.latest_chunk("db.c").await.unwrap().unwrap();
        assert_eq!(latest.shard, "b");
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemMetaStore::new();
        let epoch = Epoch::new();
        let current = ChunkVersion::new(1, 0, epoch);
        store.put_chunk(chunk("db.c", 0, 5, "a", current));

        let batch = MetaUpdate {
            updates: vec![chunk("db.c", 0, 5, "b", ChunkVersion::new(2, 0, epoch))],
            pre_condition: PreCondition {
                ns: "db.c".to_string(),
                expected_lastmod: current,
            },
        };

        store.fail_next_apply(MetaFault::UnknownApplied);
        assert!(matches!(
            store.apply_updates(batch.clone()).await,
            Err(MetaError::Unknown(_))
        ));
        // but the update landed
        let latest = store.latest_chunk("db.c").await.unwrap().unwrap();
        assert_eq!(latest.shard, "b");
    }
}
