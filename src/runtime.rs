//! Shard runtime wiring
//!
//! One `ShardRuntime` is everything a shard process needs to take part
//! in migrations: the store with its capture hooks installed, the
//! cached sharding state, a donor group and a recipient group, and the
//! external collaborators behind their seams. It also exposes the
//! command handlers the admin dispatch layer routes to.

use crate::cleanup::{RangeDeleter, StoreRangeDeleter};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::meta::{DistLockService, MetaStore};
use crate::migrate::{coordinator, DonorGroup, RecipientGroup};
use crate::protocol::{
    CloneBatch, CollectionDescription, CommitReply, ModBatch, MoveChunkRequest, RecvChunkStart,
    RecvChunkStartOne, ShardLink, StartedReply, StatusReply,
};
use crate::repl::Replication;
use crate::routing::ShardingState;
use crate::store::{CollectionStore, ShardingHooks};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

/// One shard process.
pub struct ShardRuntime {
    pub config: Config,
    pub store: Arc<CollectionStore>,
    pub sharding: Arc<ShardingState>,
    pub donor: Arc<DonorGroup>,
    pub recipient: Arc<RecipientGroup>,
    pub meta: Arc<dyn MetaStore>,
    pub locks: Arc<dyn DistLockService>,
    pub repl: Arc<dyn Replication>,
    pub deleter: Arc<dyn RangeDeleter>,
    /// Process-wide interrupt flag polled by long-running loops.
    pub interrupted: Arc<AtomicBool>,
    links: DashMap<String, Arc<dyn ShardLink>>,
}

impl ShardRuntime {
    pub fn new(
        shard_name: &str,
        config: Config,
        meta: Arc<dyn MetaStore>,
        locks: Arc<dyn DistLockService>,
        repl: Arc<dyn Replication>,
    ) -> Arc<Self> {
        let store = Arc::new(CollectionStore::new());
        let sharding = Arc::new(ShardingState::new(shard_name, Arc::clone(&meta)));
        let donor = Arc::new(DonorGroup::new(
            Arc::clone(&store),
            config.migration.clone(),
        ));
        store.set_hooks(Arc::clone(&donor) as Arc<dyn ShardingHooks>);
        let deleter: Arc<dyn RangeDeleter> =
            Arc::new(StoreRangeDeleter::new(Arc::clone(&store)));
        let recipient = Arc::new(RecipientGroup::new(
            config.migration.clone(),
            Arc::clone(&store),
            Arc::clone(&sharding),
            Arc::clone(&repl),
            Arc::clone(&deleter),
            Arc::clone(&meta),
        ));

        Arc::new(ShardRuntime {
            config,
            store,
            sharding,
            donor,
            recipient,
            meta,
            locks,
            repl,
            deleter,
            interrupted: Arc::new(AtomicBool::new(false)),
            links: DashMap::new(),
        })
    }

    pub fn shard_name(&self) -> &str {
        self.sharding.shard_name()
    }

    /// Register the client used to reach a peer shard.
    pub fn register_link(&self, shard: &str, link: Arc<dyn ShardLink>) {
        self.links.insert(shard.to_string(), link);
    }

    pub fn link(&self, shard: &str) -> Result<Arc<dyn ShardLink>> {
        self.links
            .get(shard)
            .map(|l| Arc::clone(&l))
            .ok_or_else(|| MigrateError::Transport {
                shard: shard.to_string(),
                reason: "no connection registered".to_string(),
            })
    }

    /// `moveChunk`: the donor protocol entry point.
    pub async fn move_chunk(self: &Arc<Self>, req: MoveChunkRequest) -> Result<()> {
        coordinator::move_chunk(self, req).await
    }

    /// `_recvChunkStart`: seed the incoming migration identity.
    pub async fn recv_chunk_start(self: &Arc<Self>, req: RecvChunkStart) -> Result<StartedReply> {
        info!(ns = %req.ns, migration_id = %req.migration_id, "starting _recvChunkStart");

        if self.recipient.is_active_migration(req.migration_id) {
            return Err(MigrateError::MigrationActive);
        }

        // deletes from an earlier migration are serialized by the
        // distributed collection lock; never accept a subrange while
        // its data may still be draining
        let num_deletes = self.deleter.current_deletes();
        if num_deletes > 0 {
            return Err(MigrateError::invalid(format!(
                "can't accept new chunks because there are still {} deletes from previous migration",
                num_deletes
            )));
        }

        if !self.sharding.enabled() {
            self.sharding.initialize(&req.config_server);
        }

        // forced remote refresh keeps the behavior predictable and
        // yields the epoch pending ranges are registered under
        let current_version = self.sharding.refresh_metadata_now(&req.ns).await?;

        let mut secondary_throttle = req.secondary_throttle;
        if secondary_throttle && !self.repl.enabled() {
            warn!("secondaryThrottle asked for, but no replication");
            secondary_throttle = false;
        }

        let link = self.link(&req.from)?;
        self.recipient.start_new(
            req.migration_id,
            &req.ns,
            &req.from,
            req.min,
            req.max,
            req.shard_key_pattern,
            current_version.epoch(),
            secondary_throttle,
            link,
        );

        Ok(StartedReply { started: true })
    }

    /// `_recvChunkStartOne`: launch the receive task for one namespace.
    pub async fn recv_chunk_start_one(
        self: &Arc<Self>,
        req: RecvChunkStartOne,
    ) -> Result<StartedReply> {
        info!(ns = %req.ns, migration_id = %req.migration_id, "starting _recvChunkStartOne");

        if !self.recipient.is_active_migration(req.migration_id) {
            return Err(MigrateError::invalid(format!(
                "no active incoming migration with id {}",
                req.migration_id
            )));
        }

        let current_version = self.sharding.refresh_metadata_now(&req.ns).await?;

        let session = self
            .recipient
            .prepare_session(&req.ns, current_version.epoch())?;
        session.prepare();
        tokio::spawn(Arc::clone(&session).go());

        Ok(StartedReply { started: true })
    }

    /// `_recvChunkStatus`
    pub fn recv_chunk_status(&self) -> StatusReply {
        self.recipient.status()
    }

    /// `_recvChunkCommit`
    pub async fn recv_chunk_commit(&self) -> CommitReply {
        let ok = self.recipient.start_commit().await;
        CommitReply {
            ok,
            status: self.recipient.status(),
        }
    }

    /// `_recvChunkAbort`
    pub fn recv_chunk_abort(&self) -> StatusReply {
        self.recipient.abort();
        self.recipient.status()
    }

    /// `_migrateClone`
    pub fn migrate_clone(&self, ns: &str) -> Result<CloneBatch> {
        self.donor.clone_batch(ns)
    }

    /// `_transferMods`
    pub fn transfer_mods(&self, ns: &str) -> Result<ModBatch> {
        self.donor.transfer_mods(ns)
    }

    /// Collection shape for recipient-side namespace replication.
    pub fn collection_description(&self, ns: &str) -> Option<CollectionDescription> {
        self.store.collection(ns).map(|c| CollectionDescription {
            options: c.options().clone(),
            key_pattern: c.key_pattern().pattern_doc(),
            indexes: c.indexes(),
        })
    }
}

/// In-process transport: forwards every command straight into the
/// target runtime. Tests and the demo wire clusters with it.
pub struct LoopbackLink {
    target: Arc<ShardRuntime>,
}

impl LoopbackLink {
    pub fn new(target: Arc<ShardRuntime>) -> Arc<Self> {
        Arc::new(LoopbackLink { target })
    }
}

#[async_trait]
impl ShardLink for LoopbackLink {
    async fn recv_chunk_start(&self, req: RecvChunkStart) -> Result<StartedReply> {
        self.target.recv_chunk_start(req).await
    }

    async fn recv_chunk_start_one(&self, req: RecvChunkStartOne) -> Result<StartedReply> {
        self.target.recv_chunk_start_one(req).await
    }

    async fn recv_chunk_status(&self) -> Result<StatusReply> {
        Ok(self.target.recv_chunk_status())
    }

    async fn recv_chunk_commit(&self) -> Result<CommitReply> {
        Ok(self.target.recv_chunk_commit().await)
    }

    async fn recv_chunk_abort(&self) -> Result<StatusReply> {
        Ok(self.target.recv_chunk_abort())
    }

    async fn migrate_clone(&self, ns: &str) -> Result<CloneBatch> {
        self.target.migrate_clone(ns)
    }

    async fn transfer_mods(&self, ns: &str) -> Result<ModBatch> {
        self.target.transfer_mods(ns)
    }

    async fn collection_description(&self, ns: &str) -> Result<Option<CollectionDescription>> {
        Ok(self.target.collection_description(ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MemLockService, MemMetaStore};
    use crate::repl::NoReplication;

    fn runtime(name: &str) -> Arc<ShardRuntime> {
        ShardRuntime::new(
            name,
            Config::default(),
            Arc::new(MemMetaStore::new()),
            Arc::new(MemLockService::new()),
            Arc::new(NoReplication),
        )
    }

    #[test]
    fn test_link_registry() {
        let a = runtime("shard0001");
        let b = runtime("shard0002");
        assert!(a.link("shard0002").is_err());

        a.register_link("shard0002", LoopbackLink::new(Arc::clone(&b)));
        assert!(a.link("shard0002").is_ok());
    }

    #[tokio::test]
    async fn test_status_when_idle() {
        let rt = runtime("shard0001");
        let status = rt.recv_chunk_status();
        assert!(!status.active);
        assert_eq!(status.counts.cloned, 0);
    }

    #[tokio::test]
    async fn test_commands_without_active_migration() {
        let rt = runtime("shard0001");
        assert!(rt.migrate_clone("db.none").is_err());
        assert!(rt.transfer_mods("db.none").is_err());
        let commit = rt.recv_chunk_commit().await;
        assert!(!commit.ok);
    }
}
