//! Individual collection implementation

use crate::doc::{canonical_id, id_doc, Document};
use crate::error::{MigrateError, Result};
use crate::keys::{OrderedKey, ShardKeyPattern};
use crate::store::hooks::{ModContext, OpKind};
use crate::store::HookSlot;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Storage address of one record. Allocation order approximates
/// placement order, so locator-sorted reads stay mostly sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

/// Collection creation options, replicated to the recipient verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub capped: bool,
}

/// Index definition, replicated to the recipient verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: Document,
    pub unique: bool,
}

struct StoredRecord {
    doc: Document,
    key: OrderedKey,
    size: usize,
    resident: bool,
}

#[derive(Default)]
struct Inner {
    records: HashMap<u64, StoredRecord>,
    id_index: HashMap<String, u64>,
    key_index: BTreeSet<(OrderedKey, u64)>,
    next_id: u64,
    data_bytes: u64,
}

impl Inner {
    fn find_doc(&self, id: &Value) -> Option<Document> {
        self.id_index
            .get(&canonical_id(id))
            .and_then(|loc| self.records.get(loc))
            .map(|r| r.doc.clone())
    }
}

/// A single in-memory collection with an `_id` index and an ordered
/// shard-key index. Write hooks fire under the write lock.
pub struct Collection {
    ns: String,
    options: CollectionOptions,
    key_pattern: ShardKeyPattern,
    indexes: Mutex<Vec<IndexSpec>>,
    hooks: Arc<HookSlot>,
    op_clock: Arc<AtomicU64>,
    inner: RwLock<Inner>,
}

impl Collection {
    pub(crate) fn new(
        ns: &str,
        options: CollectionOptions,
        key_pattern: ShardKeyPattern,
        hooks: Arc<HookSlot>,
        op_clock: Arc<AtomicU64>,
    ) -> Self {
        let mut id_key = Document::new();
        id_key.insert("_id", Value::from(1));
        let indexes = vec![
            IndexSpec {
                name: "_id_".to_string(),
                key: id_key,
                unique: true,
            },
            IndexSpec {
                name: index_name(&key_pattern.pattern_doc()),
                key: key_pattern.pattern_doc(),
                unique: false,
            },
        ];
        Collection {
            ns: ns.to_string(),
            options,
            key_pattern,
            indexes: Mutex::new(indexes),
            hooks,
            op_clock,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub fn key_pattern(&self) -> &ShardKeyPattern {
        &self.key_pattern
    }

    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.indexes.lock().clone()
    }

    pub fn ensure_index(&self, spec: IndexSpec) {
        let mut indexes = self.indexes.lock();
        if !indexes.iter().any(|i| i.name == spec.name) {
            indexes.push(spec);
        }
    }

    /// Insert or replace by `_id`. Reports the mutation to the sharding
    /// hook before releasing the write lock.
    pub fn upsert(&self, doc: Document) -> Result<()> {
        let id = doc
            .id()
            .cloned()
            .ok_or_else(|| MigrateError::invalid("document missing _id"))?;
        let key = self.key_pattern.extract_key(&doc);
        let size = doc.approx_size();

        let hooks = self.hooks.read().clone();
        let mut inner = self.inner.write();

        let id_key = canonical_id(&id);
        let kind = if let Some(loc) = inner.id_index.get(&id_key).copied() {
            let old = inner.records.remove(&loc).expect("id index out of sync");
            inner.key_index.remove(&(old.key, loc));
            inner.data_bytes -= old.size as u64;
            inner.key_index.insert((key.clone(), loc));
            inner.records.insert(
                loc,
                StoredRecord {
                    doc: doc.clone(),
                    key,
                    size,
                    resident: true,
                },
            );
            inner.data_bytes += size as u64;
            OpKind::Update
        } else {
            let loc = inner.next_id;
            inner.next_id += 1;
            inner.id_index.insert(id_key, loc);
            inner.key_index.insert((key.clone(), loc));
            inner.records.insert(
                loc,
                StoredRecord {
                    doc: doc.clone(),
                    key,
                    size,
                    resident: true,
                },
            );
            inner.data_bytes += size as u64;
            OpKind::Insert
        };

        self.op_clock.fetch_add(1, Ordering::SeqCst);

        let inner_ref: &Inner = &inner;
        let find = |id: &Value| inner_ref.find_doc(id);
        let ctx = ModContext {
            kind,
            ns: &self.ns,
            doc: &doc,
            id_pattern: None,
            not_in_active_chunk: false,
            find_by_id: &find,
        };
        hooks.on_mod(&ctx);
        Ok(())
    }

    /// Remove one document by `_id`. `not_in_active_chunk` marks
    /// migration-cleanup deletes so they are not captured as user data.
    pub fn remove_by_id(&self, id: &Value, not_in_active_chunk: bool) -> bool {
        let hooks = self.hooks.read().clone();
        let mut inner = self.inner.write();

        let id_key = canonical_id(id);
        let loc = match inner.id_index.get(&id_key).copied() {
            Some(loc) => loc,
            None => return false,
        };

        if !self.options.capped {
            hooks.on_about_to_delete(&self.ns, RecordId(loc));
        }

        inner.id_index.remove(&id_key);
        let old = inner.records.remove(&loc).expect("id index out of sync");
        inner.key_index.remove(&(old.key, loc));
        inner.data_bytes -= old.size as u64;

        self.op_clock.fetch_add(1, Ordering::SeqCst);

        let wrapped = id_doc(id);
        let inner_ref: &Inner = &inner;
        let find = |id: &Value| inner_ref.find_doc(id);
        let ctx = ModContext {
            kind: OpKind::Delete,
            ns: &self.ns,
            doc: &wrapped,
            id_pattern: Some(id),
            not_in_active_chunk,
            find_by_id: &find,
        };
        hooks.on_mod(&ctx);
        true
    }

    /// Remove every document whose shard key lies in `[min, max)` (or
    /// `[min, max]` when `max_inclusive`). Each removed document is
    /// offered to `saver` first.
    pub fn remove_range(
        &self,
        min: &Document,
        max: &Document,
        max_inclusive: bool,
        not_in_active_chunk: bool,
        mut saver: Option<&mut dyn FnMut(&Document) -> Result<()>>,
    ) -> Result<u64> {
        let victims: Vec<(Value, Document)> = {
            let inner = self.inner.read();
            let min_key = self.key_pattern.key_from_bound(min);
            let max_key = self.key_pattern.key_from_bound(max);
            inner
                .records
                .values()
                .filter(|r| {
                    r.key >= min_key
                        && (r.key < max_key || (max_inclusive && r.key == max_key))
                })
                .filter_map(|r| r.doc.id().map(|id| (id.clone(), r.doc.clone())))
                .collect()
        };

        let mut removed = 0;
        for (id, doc) in victims {
            if let Some(saver) = saver.as_deref_mut() {
                saver(&doc)?;
            }
            if self.remove_by_id(&id, not_in_active_chunk) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn find_by_id(&self, id: &Value) -> Option<Document> {
        self.inner.read().find_doc(id)
    }

    /// Record locators in `[min, max)`, in shard-key index order.
    pub fn scan_range_locs(&self, min: &Document, max: &Document) -> Vec<RecordId> {
        let inner = self.inner.read();
        let min_key = self.key_pattern.extend_range_bound(min);
        let max_key = self.key_pattern.extend_range_bound(max);
        inner
            .key_index
            .range((
                Bound::Included((min_key, 0u64)),
                Bound::Excluded((max_key, 0u64)),
            ))
            .map(|(_, loc)| RecordId(*loc))
            .collect()
    }

    pub fn get(&self, loc: RecordId) -> Option<Document> {
        self.inner.read().records.get(&loc.0).map(|r| r.doc.clone())
    }

    pub fn is_resident(&self, loc: RecordId) -> bool {
        self.inner
            .read()
            .records
            .get(&loc.0)
            .map(|r| r.resident)
            .unwrap_or(true)
    }

    /// Fault the record back in. Runs without the caller holding any
    /// collection lock.
    pub fn touch(&self, loc: RecordId) {
        if let Some(record) = self.inner.write().records.get_mut(&loc.0) {
            record.resident = true;
        }
    }

    /// Test hook: evict a record from the simulated page cache.
    pub fn mark_non_resident(&self, loc: RecordId) {
        if let Some(record) = self.inner.write().records.get_mut(&loc.0) {
            record.resident = false;
        }
    }

    pub fn num_records(&self) -> u64 {
        self.inner.read().records.len() as u64
    }

    pub fn data_size(&self) -> u64 {
        self.inner.read().data_bytes
    }

    pub fn avg_obj_size(&self) -> u64 {
        let inner = self.inner.read();
        let n = inner.records.len() as u64;
        if n == 0 {
            0
        } else {
            inner.data_bytes / n
        }
    }

    /// Count of documents whose key lies in `[min, max)`.
    pub fn count_range(&self, min: &Document, max: &Document) -> u64 {
        self.scan_range_locs(min, max).len() as u64
    }

    /// Every document, for test assertions.
    pub fn all_docs(&self) -> Vec<Document> {
        self.inner
            .read()
            .records
            .values()
            .map(|r| r.doc.clone())
            .collect()
    }
}

fn index_name(pattern: &Document) -> String {
    let mut name = String::new();
    for (field, spec) in pattern.0.iter() {
        if !name.is_empty() {
            name.push('_');
        }
        name.push_str(field);
        name.push('_');
        match spec {
            Value::String(s) => name.push_str(s),
            other => name.push_str(&other.to_string()),
        }
    }
    name
}
