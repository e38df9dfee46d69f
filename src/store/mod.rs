//! In-memory storage engine seam
//!
//! The migration engine only needs a narrow slice of a storage engine:
//! namespaced collections, record locators, an ordered shard-key index,
//! `_id` lookup, and write hooks that fire under the collection write
//! lock. This module provides exactly that slice.

pub mod collection;
pub mod hooks;

pub use collection::{Collection, CollectionOptions, IndexSpec, RecordId};
pub use hooks::{ModContext, NullHooks, OpKind, ShardingHooks};

use crate::error::{MigrateError, Result};
use crate::keys::ShardKeyPattern;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type HookSlot = RwLock<Arc<dyn ShardingHooks>>;

/// All collections owned by one shard process.
pub struct CollectionStore {
    collections: DashMap<String, Arc<Collection>>,
    hooks: Arc<HookSlot>,
    op_clock: Arc<AtomicU64>,
}

impl CollectionStore {
    pub fn new() -> Self {
        CollectionStore {
            collections: DashMap::new(),
            hooks: Arc::new(RwLock::new(Arc::new(NullHooks))),
            op_clock: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register the sharding write-hook listener. Mutations on every
    /// collection invoke it synchronously under the write lock.
    pub fn set_hooks(&self, hooks: Arc<dyn ShardingHooks>) {
        *self.hooks.write() = hooks;
    }

    pub fn create_collection(
        &self,
        ns: &str,
        options: CollectionOptions,
        key_pattern: ShardKeyPattern,
    ) -> Result<Arc<Collection>> {
        if self.collections.contains_key(ns) {
            return Err(MigrateError::invalid(format!(
                "namespace already exists: {}",
                ns
            )));
        }
        let collection = Arc::new(Collection::new(
            ns,
            options,
            key_pattern,
            Arc::clone(&self.hooks),
            Arc::clone(&self.op_clock),
        ));
        self.collections.insert(ns.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    pub fn collection(&self, ns: &str) -> Option<Arc<Collection>> {
        self.collections.get(ns).map(|c| Arc::clone(&c))
    }

    pub fn collection_or_err(&self, ns: &str) -> Result<Arc<Collection>> {
        self.collection(ns)
            .ok_or_else(|| MigrateError::NamespaceNotFound { ns: ns.to_string() })
    }

    pub fn exists(&self, ns: &str) -> bool {
        self.collections.contains_key(ns)
    }

    /// Monotonic clock advanced by every mutation on any collection.
    /// Replication waits are phrased against this.
    pub fn last_op(&self) -> u64 {
        self.op_clock.load(Ordering::SeqCst)
    }
}

impl Default for CollectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Document;
    use serde_json::json;

    fn pattern() -> ShardKeyPattern {
        ShardKeyPattern::parse(&Document::from_value(json!({"x": 1})).unwrap()).unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let store = CollectionStore::new();
        store
            .create_collection("db.coll", CollectionOptions::default(), pattern())
            .unwrap();
        assert!(store.exists("db.coll"));
        assert!(store.collection("db.other").is_none());
        assert!(store
            .create_collection("db.coll", CollectionOptions::default(), pattern())
            .is_err());
    }

    #[test]
    fn test_op_clock_advances() {
        let store = CollectionStore::new();
        let coll = store
            .create_collection("db.coll", CollectionOptions::default(), pattern())
            .unwrap();
        let before = store.last_op();
        coll.upsert(Document::from_value(json!({"_id": 1, "x": 2})).unwrap())
            .unwrap();
        assert!(store.last_op() > before);
    }
}
