//! Donor-side migration session
//!
//! One session per migrating namespace. It owns the clone plan (record
//! locators discovered at snapshot time) and the capture buffers
//! (`reload` and `deleted`) that record every write landing in the
//! range after the snapshot. The recipient drains both through
//! `_migrateClone` and `_transferMods`.

use crate::config::MigrationConfig;
use crate::doc::{id_doc, value_size, Document};
use crate::error::{MigrateError, Result};
use crate::keys::{is_in_range, ShardKeyPattern};
use crate::protocol::{CloneBatch, ModBatch};
use crate::store::{CollectionStore, ModContext, OpKind, RecordId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Hard cap on documents per chunk regardless of byte budget.
pub const MAX_OBJECTS_PER_CHUNK: u64 = 250_000;

/// Per-entry overhead charged to capture memory on top of the id size.
const CAPTURE_ENTRY_OVERHEAD: u64 = 5;

struct ActiveRange {
    ns: String,
    min: Document,
    max: Document,
    pattern: ShardKeyPattern,
}

#[derive(Default)]
struct Tracker {
    /// Locators still to be cloned, in storage order.
    clone_locs: BTreeSet<RecordId>,
    /// Ids inserted or updated into the range after the snapshot.
    reload: VecDeque<Value>,
    /// Ids deleted from the range after the snapshot.
    deleted: VecDeque<Value>,
    memory_used: u64,
}

/// Cooperative-yield budget for the clone loop: give up the buffers
/// after a fixed number of records or a wall-time slice, whichever
/// comes first.
struct ElapsedTracker {
    hits_between: u32,
    interval: Duration,
    count: u32,
    last: Instant,
}

impl ElapsedTracker {
    fn new(hits_between: u32, interval: Duration) -> Self {
        ElapsedTracker {
            hits_between,
            interval,
            count: 0,
            last: Instant::now(),
        }
    }

    fn interval_elapsed(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.hits_between || self.last.elapsed() >= self.interval {
            self.count = 0;
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Donor-side state for one namespace under migration.
pub struct DonorSession {
    store: Arc<CollectionStore>,
    config: MigrationConfig,
    active: Mutex<Option<ActiveRange>>,
    tracker: Mutex<Tracker>,
    crit: watch::Sender<bool>,
}

impl DonorSession {
    pub fn new(store: Arc<CollectionStore>, config: MigrationConfig) -> Self {
        let (crit, _) = watch::channel(false);
        DonorSession {
            store,
            config,
            active: Mutex::new(None),
            tracker: Mutex::new(Tracker::default()),
            crit,
        }
    }

    /// Activate capture for `[min, max)` of `ns`. Fails when another
    /// migration already owns this session.
    pub fn start(
        &self,
        ns: &str,
        min: &Document,
        max: &Document,
        pattern: &ShardKeyPattern,
    ) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(MigrateError::MigrationActive);
        }
        if ns.is_empty() || min.is_empty() || max.is_empty() {
            return Err(MigrateError::invalid("migration range must be non-empty"));
        }

        let tracker = self.tracker.lock();
        debug_assert!(tracker.clone_locs.is_empty());
        debug_assert!(tracker.reload.is_empty());
        debug_assert!(tracker.deleted.is_empty());
        drop(tracker);

        *active = Some(ActiveRange {
            ns: ns.to_string(),
            min: min.clone(),
            max: max.clone(),
            pattern: pattern.clone(),
        });
        Ok(())
    }

    /// Deactivate and clear everything; wakes critical-section waiters.
    pub fn done(&self) {
        {
            let mut tracker = self.tracker.lock();
            tracker.clone_locs.clear();
            tracker.reload.clear();
            tracker.deleted.clear();
            tracker.memory_used = 0;
        }
        *self.active.lock() = None;
        self.crit.send_replace(false);
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Capture one mutation. Runs on the writing thread while it holds
    /// the collection write lock.
    pub fn log_mod(&self, ctx: &ModContext<'_>) {
        let active = self.active.lock();
        let Some(range) = active.as_ref() else {
            return;
        };
        if range.ns != ctx.ns {
            return;
        }
        if matches!(ctx.kind, OpKind::Noop | OpKind::Command) {
            return;
        }

        let Some(id) = ctx.id() else {
            warn!(ns = ctx.ns, "mod capture got write with no _id, ignoring: {}", ctx.doc);
            return;
        };

        let post_image = match ctx.kind {
            OpKind::Delete => {
                if ctx.not_in_active_chunk {
                    // cleanup of an older migration, not user data
                    return;
                }
                let mut tracker = self.tracker.lock();
                tracker.memory_used += value_size(&id) as u64 + CAPTURE_ENTRY_OVERHEAD;
                tracker.deleted.push_back(id);
                return;
            }
            OpKind::Insert => ctx.doc.clone(),
            OpKind::Update => match (ctx.find_by_id)(&id) {
                Some(doc) => doc,
                None => {
                    warn!(
                        ns = ctx.ns,
                        "mod capture couldn't find {} even though it should be there", id
                    );
                    return;
                }
            },
            OpKind::Noop | OpKind::Command => unreachable!(),
        };

        if !is_in_range(&post_image, &range.min, &range.max, &range.pattern) {
            return;
        }

        let mut tracker = self.tracker.lock();
        tracker.memory_used += value_size(&id) as u64 + CAPTURE_ENTRY_OVERHEAD;
        tracker.reload.push_back(id);
    }

    /// Drop a locator from the clone plan before its record is deleted,
    /// so a stale read cannot transfer an already-deleted record.
    pub fn about_to_delete(&self, ns: &str, loc: RecordId) {
        let active = self.active.lock();
        let Some(range) = active.as_ref() else {
            return;
        };
        if range.ns != ns {
            return;
        }
        self.tracker.lock().clone_locs.remove(&loc);
    }

    /// Plan the clone: collect the locators of every record currently
    /// in the range. Refuses ranges whose estimated size exceeds
    /// `max_chunk_bytes` (with 30% slack), reporting the true estimate.
    pub fn store_current_locs(&self, max_chunk_bytes: u64) -> Result<()> {
        let (ns, min, max, pattern) = {
            let active = self.active.lock();
            let range = active
                .as_ref()
                .ok_or_else(|| MigrateError::internal("no active migration"))?;
            (
                range.ns.clone(),
                range.min.clone(),
                range.max.clone(),
                range.pattern.clone(),
            )
        };

        let collection = self.store.collection_or_err(&ns)?;
        if collection.key_pattern().pattern_doc() != pattern.pattern_doc() {
            return Err(MigrateError::internal(format!(
                "can't find index for {} matching shard key pattern {}",
                ns,
                pattern.pattern_doc()
            )));
        }

        let total_recs = collection.num_records();
        let avg_rec_size = collection.avg_obj_size();
        let max_recs_when_full = if total_recs > 0 && avg_rec_size > 0 {
            std::cmp::min(
                MAX_OBJECTS_PER_CHUNK + 1,
                130 * (max_chunk_bytes / avg_rec_size) / 100,
            )
        } else {
            MAX_OBJECTS_PER_CHUNK + 1
        };

        // full traversal even when the chunk is oversized, to report
        // the true record count
        let locs = collection.scan_range_locs(&min, &max);
        let rec_count = locs.len() as u64;

        if rec_count > max_recs_when_full {
            let estimated = rec_count * avg_rec_size;
            warn!(
                ns = %ns,
                estimated,
                max_chunk_bytes,
                "can't move chunk of size (approximately) {} because maximum size allowed to move is {}",
                estimated, max_chunk_bytes
            );
            return Err(MigrateError::ChunkTooBig {
                estimated_bytes: estimated,
                max_bytes: max_chunk_bytes,
            });
        }

        let mut tracker = self.tracker.lock();
        tracker.clone_locs = locs.into_iter().collect();
        info!(ns = %ns, documents = tracker.clone_locs.len(), "moveChunk number of documents");
        Ok(())
    }

    /// Serve one clone batch in locator order. Always carries at least
    /// one document when any remain; an empty batch signals completion.
    /// Non-resident records are prefetched outside the buffer lock and
    /// retried.
    pub fn clone_batch(&self) -> Result<CloneBatch> {
        let ns = {
            let active = self.active.lock();
            let range = active
                .as_ref()
                .ok_or_else(|| MigrateError::internal("not active"))?;
            range.ns.clone()
        };
        let collection = self.store.collection_or_err(&ns)?;

        let mut objects: Vec<Document> = Vec::new();
        let mut bytes = 0usize;
        let mut yielder = ElapsedTracker::new(128, Duration::from_millis(10));

        loop {
            let snapshot: Vec<RecordId> = {
                let tracker = self.tracker.lock();
                tracker.clone_locs.iter().take(128).copied().collect()
            };
            if snapshot.is_empty() {
                break;
            }

            let mut consumed: Vec<RecordId> = Vec::new();
            let mut to_touch: Option<RecordId> = None;
            let mut filled = false;

            for loc in snapshot {
                if yielder.interval_elapsed() {
                    break;
                }
                if !collection.is_resident(loc) {
                    to_touch = Some(loc);
                    break;
                }
                match collection.get(loc) {
                    None => consumed.push(loc),
                    Some(doc) => {
                        let size = doc.approx_size();
                        // count array overhead and always ship at least one doc
                        if !objects.is_empty()
                            && bytes + size + 1024 > self.config.clone_batch_max_bytes
                        {
                            filled = true;
                            break;
                        }
                        bytes += size;
                        objects.push(doc);
                        consumed.push(loc);
                    }
                }
            }

            {
                let mut tracker = self.tracker.lock();
                for loc in &consumed {
                    tracker.clone_locs.remove(loc);
                }
            }

            if let Some(loc) = to_touch {
                // prefetch without holding the buffer lock, then retry
                collection.touch(loc);
            }

            if filled {
                break;
            }
        }

        Ok(CloneBatch { objects })
    }

    /// Drain captured mods: deleted ids first, then reload ids exploded
    /// into their current full documents, up to the soft byte cap.
    pub fn transfer_mods(&self) -> Result<ModBatch> {
        let ns = {
            let active = self.active.lock();
            let range = active
                .as_ref()
                .ok_or_else(|| MigrateError::internal("no active migration"))?;
            range.ns.clone()
        };
        let collection = self.store.collection_or_err(&ns)?;
        let cap = self.config.transfer_mods_max_bytes as u64;

        let mut deleted: Vec<Document> = Vec::new();
        let mut reload: Vec<Document> = Vec::new();
        let mut size = 0u64;

        while size < cap {
            let id = match self.tracker.lock().deleted.pop_front() {
                Some(id) => id,
                None => break,
            };
            let wrapped = id_doc(&id);
            size += wrapped.approx_size() as u64;
            deleted.push(wrapped);
        }

        while size < cap {
            let id = match self.tracker.lock().reload.pop_front() {
                Some(id) => id,
                None => break,
            };
            // the doc may have been deleted since capture; skip it, the
            // deletion was captured separately
            if let Some(doc) = collection.find_by_id(&id) {
                size += doc.approx_size() as u64;
                reload.push(doc);
            }
        }

        Ok(ModBatch {
            deleted,
            reload,
            size,
        })
    }

    pub fn clone_locs_remaining(&self) -> usize {
        self.tracker.lock().clone_locs.len()
    }

    /// Bytes charged to the capture buffers since `start`.
    pub fn bytes_used(&self) -> u64 {
        self.tracker.lock().memory_used
    }

    pub fn set_in_critical_section(&self, value: bool) {
        info!(in_critical_section = value, "migrate critical section flag changed");
        self.crit.send_replace(value);
    }

    pub fn in_critical_section(&self) -> bool {
        *self.crit.borrow()
    }

    /// Wait until the critical section clears; true when it did within
    /// the timeout.
    pub async fn wait_till_not_in_critical_section(&self, timeout: Duration) -> bool {
        let mut rx = self.crit.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|v| !*v)).await;
        result.is_ok()
    }
}
