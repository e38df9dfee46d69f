//! Donor-side migration group
//!
//! Collections declared as linked migrate together to stay co-located,
//! so the donor keeps one session per namespace under a single active
//! migration. The group is also the storage engine's write-hook
//! listener; namespaces outside the active set land on a shared
//! no-op sentinel session, so the hook is always safe to call.

use crate::config::MigrationConfig;
use crate::doc::Document;
use crate::error::{MigrateError, Result};
use crate::keys::ShardKeyPattern;
use crate::migrate::donor::DonorSession;
use crate::protocol::{CloneBatch, ModBatch};
use crate::store::{CollectionStore, ModContext, RecordId, ShardingHooks};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Default)]
struct GroupState {
    active: bool,
    sessions: HashMap<String, Arc<DonorSession>>,
}

/// All donor sessions of the one in-flight migration on this shard.
pub struct DonorGroup {
    store: Arc<CollectionStore>,
    config: MigrationConfig,
    state: Mutex<GroupState>,
    /// Null-object target for hook calls against namespaces that are
    /// not currently migrating. Never activated.
    generic: Arc<DonorSession>,
}

impl DonorGroup {
    pub fn new(store: Arc<CollectionStore>, config: MigrationConfig) -> Self {
        let generic = Arc::new(DonorSession::new(Arc::clone(&store), config.clone()));
        DonorGroup {
            store,
            config,
            state: Mutex::new(GroupState::default()),
            generic,
        }
    }

    /// Begin capture for every linked namespace over one shared range.
    /// Exactly one migration may be active per group; the returned
    /// guard tears the whole group down when dropped.
    pub fn start(
        self: &Arc<Self>,
        namespaces: &[String],
        min: &Document,
        max: &Document,
        pattern: &ShardKeyPattern,
    ) -> Result<DonorGuard> {
        let mut state = self.state.lock();
        if state.active {
            return Err(MigrateError::MigrationActive);
        }
        if namespaces.is_empty() {
            return Err(MigrateError::invalid("no namespaces to migrate"));
        }

        // clear any residue from an old failed migration
        for session in state.sessions.values() {
            session.done();
        }
        state.sessions.clear();

        for ns in namespaces {
            let session = Arc::new(DonorSession::new(
                Arc::clone(&self.store),
                self.config.clone(),
            ));
            session.start(ns, min, max, pattern)?;
            state.sessions.insert(ns.clone(), session);
        }
        state.active = true;
        info!(namespaces = ?namespaces, "donor migration group started");

        Ok(DonorGuard {
            group: Arc::clone(self),
        })
    }

    /// Tear down every session and clear the active flag. Safe to call
    /// when already inactive.
    pub fn done(&self) {
        let mut state = self.state.lock();
        for session in state.sessions.values() {
            session.done();
        }
        state.sessions.clear();
        state.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn session(&self, ns: &str) -> Arc<DonorSession> {
        let state = self.state.lock();
        state
            .sessions
            .get(ns)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.generic))
    }

    fn sessions(&self) -> Vec<Arc<DonorSession>> {
        self.state.lock().sessions.values().map(Arc::clone).collect()
    }

    pub fn clone_batch(&self, ns: &str) -> Result<CloneBatch> {
        self.session(ns).clone_batch()
    }

    pub fn transfer_mods(&self, ns: &str) -> Result<ModBatch> {
        self.session(ns).transfer_mods()
    }

    /// Plan the clone on every session.
    pub fn store_current_locs(&self, max_chunk_bytes: u64) -> Result<()> {
        for session in self.sessions() {
            session.store_current_locs(max_chunk_bytes)?;
        }
        Ok(())
    }

    pub fn clone_locs_remaining(&self) -> usize {
        self.sessions()
            .iter()
            .map(|s| s.clone_locs_remaining())
            .sum()
    }

    pub fn bytes_used(&self) -> u64 {
        self.sessions().iter().map(|s| s.bytes_used()).sum()
    }

    pub fn set_in_critical_section(&self, value: bool) {
        for session in self.sessions() {
            session.set_in_critical_section(value);
        }
    }

    pub fn in_critical_section(&self) -> bool {
        self.sessions().iter().any(|s| s.in_critical_section())
    }

    /// Wait for every session to leave the critical section, splitting
    /// the budget across them.
    pub async fn wait_till_not_in_critical_section(&self, timeout: Duration) -> bool {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return true;
        }
        let per_session = timeout / sessions.len() as u32 + Duration::from_secs(1);
        let mut all_clear = true;
        for session in sessions {
            all_clear &= session.wait_till_not_in_critical_section(per_session).await;
        }
        all_clear
    }
}

impl ShardingHooks for DonorGroup {
    fn on_mod(&self, ctx: &ModContext<'_>) {
        self.session(ctx.ns).log_mod(ctx);
    }

    fn on_about_to_delete(&self, ns: &str, loc: RecordId) {
        self.session(ns).about_to_delete(ns, loc);
    }
}

/// RAII scope of one donor-side migration; `done` runs on drop so
/// every early exit of the coordinator unwinds capture state.
pub struct DonorGuard {
    group: Arc<DonorGroup>,
}

impl Drop for DonorGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollectionOptions;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn pattern() -> ShardKeyPattern {
        ShardKeyPattern::parse(&doc(json!({"x": 1}))).unwrap()
    }

    fn group_with(namespaces: &[&str]) -> (Arc<CollectionStore>, Arc<DonorGroup>) {
        let store = Arc::new(CollectionStore::new());
        for ns in namespaces {
            store
                .create_collection(ns, CollectionOptions::default(), pattern())
                .unwrap();
        }
        let group = Arc::new(DonorGroup::new(
            Arc::clone(&store),
            MigrationConfig::default(),
        ));
        store.set_hooks(Arc::clone(&group) as Arc<dyn ShardingHooks>);
        (store, group)
    }

    #[test]
    fn test_single_active_group() {
        let (_store, group) = group_with(&["db.a"]);
        let namespaces = vec!["db.a".to_string()];
        let guard = group
            .start(&namespaces, &doc(json!({"x": 0})), &doc(json!({"x": 10})), &pattern())
            .unwrap();
        assert!(group.is_active());

        assert!(matches!(
            group.start(&namespaces, &doc(json!({"x": 0})), &doc(json!({"x": 10})), &pattern()),
            Err(MigrateError::MigrationActive)
        ));

        drop(guard);
        assert!(!group.is_active());
        let guard = group
            .start(&namespaces, &doc(json!({"x": 0})), &doc(json!({"x": 10})), &pattern())
            .unwrap();
        drop(guard);
    }

    #[test]
    fn test_capture_routed_by_namespace() {
        let (store, group) = group_with(&["db.a", "db.b", "db.other"]);
        let namespaces = vec!["db.a".to_string(), "db.b".to_string()];
        let _guard = group
            .start(&namespaces, &doc(json!({"x": 0})), &doc(json!({"x": 10})), &pattern())
            .unwrap();

        store
            .collection("db.a")
            .unwrap()
            .upsert(doc(json!({"_id": 1, "x": 1})))
            .unwrap();
        // sentinel swallows writes to namespaces outside the active set
        store
            .collection("db.other")
            .unwrap()
            .upsert(doc(json!({"_id": 2, "x": 2})))
            .unwrap();

        let mods_a = group.transfer_mods("db.a").unwrap();
        assert_eq!(mods_a.reload.len(), 1);
        let mods_b = group.transfer_mods("db.b").unwrap();
        assert!(mods_b.reload.is_empty());
        // unknown namespaces route to the inactive sentinel
        assert!(group.transfer_mods("db.other").is_err());
    }

    #[test]
    fn test_aggregates_fan_out() {
        let (store, group) = group_with(&["db.a", "db.b"]);
        let namespaces = vec!["db.a".to_string(), "db.b".to_string()];
        let _guard = group
            .start(&namespaces, &doc(json!({"x": 0})), &doc(json!({"x": 10})), &pattern())
            .unwrap();

        for ns in ["db.a", "db.b"] {
            let coll = store.collection(ns).unwrap();
            coll.upsert(doc(json!({"_id": 1, "x": 1}))).unwrap();
        }
        // the upserts above were captured; plan after them
        group.store_current_locs(1024 * 1024).unwrap();
        assert_eq!(group.clone_locs_remaining(), 2);
        assert!(group.bytes_used() > 0);

        group.set_in_critical_section(true);
        assert!(group.in_critical_section());
        group.set_in_critical_section(false);
        assert!(!group.in_critical_section());
    }
}
