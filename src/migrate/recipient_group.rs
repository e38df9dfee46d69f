//! Recipient-side migration group
//!
//! One migration identity covers every linked namespace arriving
//! together. `_recvChunkStart` seeds the identity, each
//! `_recvChunkStartOne` launches one session task, and the aggregate
//! status reported back to the donor is the slowest session's state
//! with failures dominating.

use crate::cleanup::RangeDeleter;
use crate::config::MigrationConfig;
use crate::doc::Document;
use crate::error::{MigrateError, Result};
use crate::keys::ShardKeyPattern;
use crate::meta::MetaStore;
use crate::migrate::recipient::RecipientSession;
use crate::protocol::{MigrateCounts, MigrationPhase, ShardLink, StatusReply};
use crate::repl::Replication;
use crate::routing::ShardingState;
use crate::store::CollectionStore;
use crate::version::{Epoch, MigrationId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared identity of the in-flight migration.
#[derive(Clone)]
struct GroupIdentity {
    ns: String,
    from: String,
    min: Document,
    max: Document,
    shard_key_pattern: Document,
    epoch: Epoch,
    secondary_throttle: bool,
    link: Arc<dyn ShardLink>,
}

#[derive(Default)]
struct GroupInner {
    active_id: Option<MigrationId>,
    identity: Option<GroupIdentity>,
    sessions: Vec<Arc<RecipientSession>>,
}

/// All recipient sessions of the one in-flight migration on this shard.
pub struct RecipientGroup {
    config: MigrationConfig,
    store: Arc<CollectionStore>,
    sharding: Arc<ShardingState>,
    repl: Arc<dyn Replication>,
    deleter: Arc<dyn RangeDeleter>,
    meta: Arc<dyn MetaStore>,
    inner: Mutex<GroupInner>,
}

impl RecipientGroup {
    pub fn new(
        config: MigrationConfig,
        store: Arc<CollectionStore>,
        sharding: Arc<ShardingState>,
        repl: Arc<dyn Replication>,
        deleter: Arc<dyn RangeDeleter>,
        meta: Arc<dyn MetaStore>,
    ) -> Self {
        RecipientGroup {
            config,
            store,
            sharding,
            repl,
            deleter,
            meta,
            inner: Mutex::new(GroupInner::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active_id.is_some()
    }

    pub fn is_active_migration(&self, id: MigrationId) -> bool {
        self.inner.lock().active_id == Some(id)
    }

    /// Seed a new migration identity, preempting any previous one.
    /// Sessions of a preempted migration are aborted; their tasks wind
    /// down on their own.
    #[allow(clippy::too_many_arguments)]
    pub fn start_new(
        &self,
        migration_id: MigrationId,
        ns: &str,
        from: &str,
        min: Document,
        max: Document,
        shard_key_pattern: Document,
        epoch: Epoch,
        secondary_throttle: bool,
        link: Arc<dyn ShardLink>,
    ) {
        let mut inner = self.inner.lock();
        if !inner.sessions.is_empty() {
            warn!(ns = %ns, "new incoming migration preempts a previous one");
            for session in &inner.sessions {
                session.abort();
            }
        }
        inner.sessions.clear();
        inner.identity = Some(GroupIdentity {
            ns: ns.to_string(),
            from: from.to_string(),
            min,
            max,
            shard_key_pattern,
            epoch,
            secondary_throttle,
            link,
        });
        inner.active_id = Some(migration_id);
        info!(ns = %ns, migration_id = %migration_id, "recipient migration group started");
    }

    /// Create (and register) the session for one namespace of the
    /// active migration. The caller launches its task.
    pub fn prepare_session(
        &self,
        ns: &str,
        epoch: Epoch,
    ) -> Result<Arc<RecipientSession>> {
        let mut inner = self.inner.lock();
        let identity = inner
            .identity
            .as_ref()
            .ok_or_else(|| MigrateError::internal("no active incoming migration"))?
            .clone();

        let session = Arc::new(RecipientSession::new(
            ns,
            identity.min.clone(),
            identity.max.clone(),
            ShardKeyPattern::parse(&identity.shard_key_pattern)?,
            epoch,
            identity.secondary_throttle,
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.sharding),
            Arc::clone(&self.repl),
            Arc::clone(&self.deleter),
            Arc::clone(&identity.link),
            Arc::clone(&self.meta),
        ));
        inner.sessions.push(Arc::clone(&session));
        Ok(session)
    }

    fn sessions(&self) -> Vec<Arc<RecipientSession>> {
        self.inner.lock().sessions.iter().map(Arc::clone).collect()
    }

    /// Aggregate status: counters are summed; the reported state is the
    /// slowest session's, except any failed session dominates.
    pub fn status(&self) -> StatusReply {
        let (identity, active, sessions) = {
            let inner = self.inner.lock();
            (
                inner.identity.clone(),
                inner.active_id.is_some(),
                inner.sessions.iter().map(Arc::clone).collect::<Vec<_>>(),
            )
        };

        let mut state = MigrationPhase::Done;
        let mut counts = MigrateCounts::default();
        let mut errmsg = None;

        for session in &sessions {
            let (cloned, cloned_bytes, catchup, steady) = session.counters();
            counts.cloned += cloned;
            counts.cloned_bytes += cloned_bytes;
            counts.catchup += catchup;
            counts.steady += steady;

            let session_state = session.state();
            if session_state < state || session_state.is_failed() {
                state = session_state;
                if session_state == MigrationPhase::Fail {
                    errmsg = session.errmsg();
                    break;
                }
            }
        }

        match identity {
            Some(identity) => StatusReply {
                active,
                ns: identity.ns,
                from: identity.from,
                min: identity.min,
                max: identity.max,
                shard_key_pattern: identity.shard_key_pattern,
                state,
                counts,
                errmsg,
            },
            None => StatusReply {
                active: false,
                ns: String::new(),
                from: String::new(),
                min: Document::new(),
                max: Document::new(),
                shard_key_pattern: Document::new(),
                state,
                counts,
                errmsg,
            },
        }
    }

    /// Fan out the commit signal; true iff every session drains to
    /// DONE within its window.
    pub async fn start_commit(&self) -> bool {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return false;
        }
        let results = join_all(
            sessions
                .iter()
                .map(|session| async move { session.start_commit().await }),
        )
        .await;
        results.into_iter().all(|ok| ok)
    }

    /// Fan out an external abort.
    pub fn abort(&self) {
        for session in self.sessions() {
            session.abort();
        }
    }
}
