//! Recipient-side migration session
//!
//! A background task per namespace drives the receive state machine:
//!
//! ```text
//! READY -> CLONE -> CATCHUP -> STEADY -> COMMIT_START -> DONE
//!   |        |         |         |            |
//!   +--------+---------+---------+------------+--------> FAIL
//!                      |
//!                      +--> ABORT (external)
//! ```
//!
//! The session pulls the bulk snapshot with `_migrateClone`, then
//! incremental deltas with `_transferMods`, refuses to finish until
//! replication caught up, and guarantees one more transfer round after
//! the donor signals commit so no mutation falls between the last poll
//! and the donor's critical section.

use crate::cleanup::{RangeDeleter, RangeDeletion, RemoveSaver};
use crate::config::MigrationConfig;
use crate::doc::Document;
use crate::error::{MigrateError, Result};
use crate::keys::{is_in_range, ShardKeyPattern};
use crate::meta::MetaStore;
use crate::migrate::MoveTiming;
use crate::protocol::{MigrationPhase, ModBatch, ShardLink};
use crate::repl::Replication;
use crate::routing::ShardingState;
use crate::store::{Collection, CollectionStore};
use crate::version::Epoch;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Counter bucket an apply round credits, by phase.
#[derive(Clone, Copy)]
enum ApplyPhase {
    Catchup,
    Steady,
}

/// Receive-side state for one namespace.
pub struct RecipientSession {
    ns: String,
    min: Document,
    max: Document,
    pattern: ShardKeyPattern,
    epoch: Epoch,
    secondary_throttle: bool,
    config: MigrationConfig,

    store: Arc<CollectionStore>,
    sharding: Arc<ShardingState>,
    repl: Arc<dyn Replication>,
    deleter: Arc<dyn RangeDeleter>,
    link: Arc<dyn ShardLink>,
    meta: Arc<dyn MetaStore>,

    active: Mutex<bool>,
    state: Mutex<MigrationPhase>,
    errmsg: Mutex<Option<String>>,
    num_cloned: AtomicU64,
    cloned_bytes: AtomicU64,
    num_catchup: AtomicU64,
    num_steady: AtomicU64,
}

#[allow(clippy::too_many_arguments)]
impl RecipientSession {
    pub fn new(
        ns: &str,
        min: Document,
        max: Document,
        pattern: ShardKeyPattern,
        epoch: Epoch,
        secondary_throttle: bool,
        config: MigrationConfig,
        store: Arc<CollectionStore>,
        sharding: Arc<ShardingState>,
        repl: Arc<dyn Replication>,
        deleter: Arc<dyn RangeDeleter>,
        link: Arc<dyn ShardLink>,
        meta: Arc<dyn MetaStore>,
    ) -> Self {
        RecipientSession {
            ns: ns.to_string(),
            min,
            max,
            pattern,
            epoch,
            secondary_throttle,
            config,
            store,
            sharding,
            repl,
            deleter,
            link,
            meta,
            active: Mutex::new(false),
            state: Mutex::new(MigrationPhase::Ready),
            errmsg: Mutex::new(None),
            num_cloned: AtomicU64::new(0),
            cloned_bytes: AtomicU64::new(0),
            num_catchup: AtomicU64::new(0),
            num_steady: AtomicU64::new(0),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn state(&self) -> MigrationPhase {
        *self.state.lock()
    }

    fn set_state(&self, state: MigrationPhase) {
        *self.state.lock() = state;
    }

    #[cfg(test)]
    pub(crate) fn set_state_for_tests(&self, state: MigrationPhase) {
        self.set_state(state);
    }

    pub fn errmsg(&self) -> Option<String> {
        self.errmsg.lock().clone()
    }

    fn set_errmsg(&self, msg: &str) {
        *self.errmsg.lock() = Some(msg.to_string());
    }

    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.num_cloned.load(Ordering::SeqCst),
            self.cloned_bytes.load(Ordering::SeqCst),
            self.num_catchup.load(Ordering::SeqCst),
            self.num_steady.load(Ordering::SeqCst),
        )
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock()
    }

    fn set_active(&self, active: bool) {
        *self.active.lock() = active;
    }

    /// Reset counters and arm the session before its task launches.
    pub fn prepare(&self) {
        let mut active = self.active.lock();
        debug_assert!(!*active);
        debug_assert!(!self.ns.is_empty());
        *self.state.lock() = MigrationPhase::Ready;
        *self.errmsg.lock() = None;
        self.num_cloned.store(0, Ordering::SeqCst);
        self.cloned_bytes.store(0, Ordering::SeqCst);
        self.num_catchup.store(0, Ordering::SeqCst);
        self.num_steady.store(0, Ordering::SeqCst);
        *active = true;
    }

    /// Run the receive state machine to completion. Any error lands in
    /// FAIL; every non-DONE exit clears the pending-incoming marker and
    /// discards partially-cloned data.
    pub async fn go(self: Arc<Self>) {
        let mut timing = MoveTiming::new("to", &self.ns, &self.min, &self.max, 5);

        if let Err(e) = self.run(&mut timing).await {
            self.set_errmsg(&e.to_string());
            self.set_state(MigrationPhase::Fail);
            error!(ns = %self.ns, error = %e, "migrate failed");
        }

        timing
            .finish(&self.meta, self.sharding.shard_name(), self.errmsg().as_deref())
            .await;

        if self.state() != MigrationPhase::Done {
            if let Err(e) = self
                .sharding
                .forget_pending(&self.ns, &self.min, &self.max, self.epoch)
            {
                warn!(ns = %self.ns, error = %e, "could not clear pending range");
            }
            let _ = self.deleter.queue_delete(RangeDeletion {
                ns: self.ns.clone(),
                min: self.min.clone(),
                max: self.max.clone(),
                secondary_throttle: self.secondary_throttle,
            });
        }

        self.set_active(false);
    }

    async fn run(&self, timing: &mut MoveTiming) -> Result<()> {
        debug_assert!(self.is_active());
        debug_assert_eq!(self.state(), MigrationPhase::Ready);

        info!(
            ns = %self.ns,
            min = %self.min,
            max = %self.max,
            epoch = %self.epoch,
            "starting receiving-end of chunk migration"
        );

        // 0. replicate the collection itself if it does not exist yet
        let description = self
            .link
            .collection_description(&self.ns)
            .await?
            .ok_or_else(|| MigrateError::NamespaceNotFound {
                ns: self.ns.clone(),
            })?;
        if !self.store.exists(&self.ns) {
            self.store.create_collection(
                &self.ns,
                description.options.clone(),
                ShardKeyPattern::parse(&description.key_pattern)?,
            )?;
        }
        let collection = self.store.collection_or_err(&self.ns)?;

        // 1. replicate index definitions
        for index in description.indexes {
            collection.ensure_index(index);
        }
        timing.done(1);

        // 2. delete any data already in range, then guard it
        let removed = {
            let mut saver = self.paranoia_saver("preCleanup");
            let mut save = |doc: &Document| -> Result<()> {
                if let Some(saver) = saver.as_mut() {
                    saver.save(doc)?;
                }
                Ok(())
            };
            collection.remove_range(&self.min, &self.max, false, true, Some(&mut save))?
        };

        self.sharding
            .note_pending(&self.ns, &self.min, &self.max, self.epoch)?;

        if removed > 0 {
            warn!(ns = %self.ns, removed, "deleted data already in chunk");
        }
        timing.done(2);

        // 3. initial bulk clone
        self.set_state(MigrationPhase::Clone);
        loop {
            if self.state() == MigrationPhase::Abort {
                timing.note("aborted");
                return Ok(());
            }

            let batch = self.link.migrate_clone(&self.ns).await?;
            if batch.objects.is_empty() {
                break;
            }

            let mut batch_ops = 0u64;
            for doc in batch.objects {
                let size = doc.approx_size() as u64;
                self.apply_upsert(&collection, doc)?;
                self.num_cloned.fetch_add(1, Ordering::SeqCst);
                self.cloned_bytes.fetch_add(size, Ordering::SeqCst);
                batch_ops += 1;
            }

            if self.secondary_throttle && batch_ops > 0 {
                let caught_up = self
                    .wait_for_replication(
                        self.store.last_op(),
                        2,
                        Duration::from_secs(self.config.secondary_throttle_timeout_secs),
                    )
                    .await;
                if !caught_up {
                    warn!(
                        ns = %self.ns,
                        "secondaryThrottle on, but doc insert timed out; continuing"
                    );
                }
            }
        }
        timing.done(3);

        let mut last_op = self.store.last_op();

        // 4. catch up on mods captured during the clone
        self.set_state(MigrationPhase::Catchup);
        loop {
            if self.state() == MigrationPhase::Abort {
                timing.note("aborted");
                return Ok(());
            }

            let mods = self.link.transfer_mods(&self.ns).await?;
            if mods.is_empty() {
                break;
            }
            self.apply(&collection, &mods, &mut last_op, ApplyPhase::Catchup)?;

            let max_iterations = self.config.catchup_wait_iterations;
            let mut i = 0;
            while i < max_iterations {
                if self.state() == MigrationPhase::Abort {
                    timing.note("aborted");
                    return Ok(());
                }
                if self
                    .repl
                    .op_replicated_enough(last_op, self.required_majority())
                {
                    break;
                }
                if i == 100 {
                    warn!(ns = %self.ns, "secondaries having hard time keeping up with migrate");
                }
                sleep(Duration::from_millis(self.config.catchup_wait_interval_ms)).await;
                i += 1;
            }
            if i == max_iterations {
                return Err(MigrateError::internal("secondary can't keep up with migrate"));
            }
        }
        timing.done(4);

        // drain replication before accepting a commit
        let drain_deadline =
            Instant::now() + Duration::from_secs(self.config.repl_drain_max_mins * 60);
        while Instant::now() < drain_deadline {
            if self.state() == MigrationPhase::Abort {
                timing.note("aborted");
                return Ok(());
            }
            if self.flush_pending_writes(last_op) {
                break;
            }
            info!(ns = %self.ns, "waiting for replication to catch up before entering critical section");
            sleep(Duration::from_secs(1)).await;
        }

        // 5. hold steady until the donor commits
        self.set_state(MigrationPhase::Steady);
        let mut transfer_after_commit = false;
        loop {
            let state = self.state();
            if state == MigrationPhase::Abort {
                timing.note("aborted");
                return Ok(());
            }
            if state != MigrationPhase::Steady && state != MigrationPhase::CommitStart {
                break;
            }
            // at least one transfer round must land after the switch to
            // COMMIT_START, or mods logged between our last poll and
            // the donor's critical section would be lost
            if state == MigrationPhase::CommitStart {
                transfer_after_commit = true;
            }

            let mods = self.link.transfer_mods(&self.ns).await?;
            if !mods.is_empty() && self.apply(&collection, &mods, &mut last_op, ApplyPhase::Steady)? {
                continue;
            }

            if self.state() == MigrationPhase::Abort {
                timing.note("aborted");
                return Ok(());
            }

            if self.state() == MigrationPhase::CommitStart
                && transfer_after_commit
                && self.flush_pending_writes(last_op)
            {
                break;
            }

            if self.state() == MigrationPhase::Steady {
                sleep(Duration::from_millis(self.config.steady_idle_ms)).await;
            }
        }

        if self.state() == MigrationPhase::Fail {
            return Err(MigrateError::internal("timed out waiting for commit"));
        }
        timing.done(5);

        self.set_state(MigrationPhase::Done);
        Ok(())
    }

    fn paranoia_saver(&self, why: &str) -> Option<RemoveSaver> {
        if self.config.move_paranoia {
            Some(RemoveSaver::new(
                &PathBuf::from(&self.config.paranoia_dir),
                "moveChunk",
                &self.ns,
                why,
            ))
        } else {
            None
        }
    }

    /// Conflict-checked upsert: a local document with the same `_id`
    /// but outside the migrating range aborts the migration rather than
    /// silently overwriting another range's data.
    fn apply_upsert(&self, collection: &Collection, doc: Document) -> Result<()> {
        if let Some(local) = self.will_override_local_id(collection, &doc) {
            let id = local.id().cloned().unwrap_or_default();
            warn!(
                ns = %self.ns,
                "cannot migrate chunk, local document {} has same _id as remote document {}",
                local,
                doc
            );
            return Err(MigrateError::DuplicateId {
                ns: self.ns.clone(),
                id,
            });
        }
        collection.upsert(doc)
    }

    fn will_override_local_id(&self, collection: &Collection, doc: &Document) -> Option<Document> {
        let id = doc.id()?;
        let local = collection.find_by_id(id)?;
        if !is_in_range(&local, &self.min, &self.max, &self.pattern) {
            Some(local)
        } else {
            None
        }
    }

    /// Apply one transfer batch. Deletes only remove ids whose local
    /// document is inside the range (an id re-used by another range
    /// must survive); reloads are conflict-checked upserts.
    fn apply(
        &self,
        collection: &Collection,
        batch: &ModBatch,
        last_op: &mut u64,
        phase: ApplyPhase,
    ) -> Result<bool> {
        let mut did_anything = false;
        let mut saver = self.paranoia_saver("removedDuring");

        for wrapped in &batch.deleted {
            let id = wrapped
                .id()
                .ok_or_else(|| MigrateError::invalid("deleted entry without _id"))?
                .clone();

            if let Some(local) = collection.find_by_id(&id) {
                if !is_in_range(&local, &self.min, &self.max, &self.pattern) {
                    info!(ns = %self.ns, "not applying out of range deletion: {}", local);
                    continue;
                }
                if let Some(saver) = saver.as_mut() {
                    saver.save(&local)?;
                }
            }

            // replayed migration delete, not user data; a co-located
            // donor session for this namespace must not capture it
            collection.remove_by_id(&id, true);
            *last_op = self.store.last_op();
            did_anything = true;
        }

        for doc in &batch.reload {
            self.apply_upsert(collection, doc.clone())?;
            *last_op = self.store.last_op();
            did_anything = true;
        }

        if did_anything {
            match phase {
                ApplyPhase::Catchup => self.num_catchup.fetch_add(1, Ordering::SeqCst),
                ApplyPhase::Steady => self.num_steady.fetch_add(1, Ordering::SeqCst),
            };
        }

        Ok(did_anything)
    }

    fn required_majority(&self) -> u32 {
        if self.repl.enabled() {
            self.repl.majority()
        } else {
            0
        }
    }

    async fn wait_for_replication(&self, op: u64, required: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.repl.op_replicated_enough(op, required) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Replication caught up and, when durability is on, the journal
    /// committed.
    fn flush_pending_writes(&self, last_op: u64) -> bool {
        if !self
            .repl
            .op_replicated_enough(last_op, self.required_majority())
        {
            return false;
        }
        if self.repl.flush_journal() {
            info!(ns = %self.ns, "migrate commit flushed to journal");
        }
        true
    }

    /// Donor-side commit signal: switch to COMMIT_START and wait for
    /// the state machine to drain to DONE.
    pub async fn start_commit(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != MigrationPhase::Steady {
                warn!(ns = %self.ns, state = state.as_str(), "startCommit failed, not in steady state");
                return false;
            }
            *state = MigrationPhase::CommitStart;
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.commit_wait_secs);
        while Instant::now() <= deadline {
            sleep(Duration::from_millis(1)).await;
            if self.state() == MigrationPhase::Done {
                return true;
            }
        }

        self.set_state(MigrationPhase::Fail);
        error!(ns = %self.ns, "startCommit never finished");
        false
    }

    /// External abort; the state machine notices at loop boundaries.
    pub fn abort(&self) {
        self.set_state(MigrationPhase::Abort);
        self.set_errmsg("aborted");
    }
}
