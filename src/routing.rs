//! Shard-local sharding state and range guards
//!
//! Each shard caches, per namespace, which chunks it owns and at what
//! version. The cache is the authority for query routing between
//! metadata refreshes, so the migration protocol manipulates it with
//! care: `donate_chunk` forgets a range under a bumped major version
//! (the donated-outgoing guard) and `note_pending` marks a range that
//! is arriving but may not be served yet (the pending-incoming guard).

use crate::doc::Document;
use crate::error::{MigrateError, Result};
use crate::keys::{is_in_range, ShardKeyPattern};
use crate::meta::MetaStore;
use crate::version::{ChunkVersion, Epoch};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One chunk owned by this shard.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedChunk {
    pub min: Document,
    pub max: Document,
    pub lastmod: ChunkVersion,
}

/// A range in flight into this shard.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRange {
    pub min: Document,
    pub max: Document,
}

/// Cached metadata for one namespace on this shard.
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    pub key_pattern: ShardKeyPattern,
    pub epoch: Epoch,
    pub shard_version: ChunkVersion,
    /// Sorted by min key at refresh time.
    pub chunks: Vec<OwnedChunk>,
    pub pending: Vec<PendingRange>,
}

impl CollectionMetadata {
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// Process-wide sharding state of one shard.
pub struct ShardingState {
    shard_name: String,
    config_server: Mutex<Option<String>>,
    collections: RwLock<HashMap<String, CollectionMetadata>>,
    meta: Arc<dyn MetaStore>,
}

impl ShardingState {
    pub fn new(shard_name: &str, meta: Arc<dyn MetaStore>) -> Self {
        ShardingState {
            shard_name: shard_name.to_string(),
            config_server: Mutex::new(None),
            collections: RwLock::new(HashMap::new()),
            meta,
        }
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    pub fn enabled(&self) -> bool {
        self.config_server.lock().is_some()
    }

    /// One-shot sharding bootstrap with the config server address.
    pub fn initialize(&self, config_server: &str) {
        let mut guard = self.config_server.lock();
        if guard.is_none() {
            info!(config_server, shard = %self.shard_name, "sharding state initialized");
            *guard = Some(config_server.to_string());
        }
    }

    pub fn config_server(&self) -> Option<String> {
        self.config_server.lock().clone()
    }

    /// Pull this shard's authoritative chunk set for `ns` from the
    /// metadata store and install it, preserving pending ranges whose
    /// epoch still matches. Returns the refreshed shard version.
    pub async fn refresh_metadata_now(&self, ns: &str) -> Result<ChunkVersion> {
        let record = self
            .meta
            .collection(ns)
            .await
            .map_err(|e| MigrateError::MetaUnreachable {
                reason: e.to_string(),
            })?
            .ok_or_else(|| MigrateError::NamespaceNotFound { ns: ns.to_string() })?;

        let key_pattern = ShardKeyPattern::parse(&record.key_pattern)?;

        let mut chunks: Vec<OwnedChunk> = self
            .meta
            .shard_chunks(ns, &self.shard_name)
            .await
            .map_err(|e| MigrateError::MetaUnreachable {
                reason: e.to_string(),
            })?
            .into_iter()
            .map(|c| OwnedChunk {
                min: c.min,
                max: c.max,
                lastmod: c.lastmod,
            })
            .collect();
        chunks.sort_by(|a, b| {
            key_pattern
                .key_from_bound(&a.min)
                .cmp(&key_pattern.key_from_bound(&b.min))
        });

        let shard_version = chunks
            .iter()
            .map(|c| c.lastmod)
            .max_by_key(|v| v.to_u64())
            .unwrap_or_else(|| ChunkVersion::zero(record.epoch));

        let mut collections = self.collections.write();
        let pending = collections
            .get(ns)
            .filter(|m| m.epoch == record.epoch)
            .map(|m| m.pending.clone())
            .unwrap_or_default();
        collections.insert(
            ns.to_string(),
            CollectionMetadata {
                key_pattern,
                epoch: record.epoch,
                shard_version,
                chunks,
                pending,
            },
        );

        info!(ns, version = %shard_version, shard = %self.shard_name, "metadata refreshed");
        Ok(shard_version)
    }

    pub fn collection_metadata(&self, ns: &str) -> Option<CollectionMetadata> {
        self.collections.read().get(ns).cloned()
    }

    pub fn get_version(&self, ns: &str) -> Option<ChunkVersion> {
        self.collections.read().get(ns).map(|m| m.shard_version)
    }

    /// Forget `[min, max)` under the new (major-bumped) version. From
    /// here until `undo_donate_chunk` or cleanup, the shard refuses to
    /// serve the range. Returns a snapshot for rollback.
    pub fn donate_chunk(
        &self,
        ns: &str,
        min: &Document,
        max: &Document,
        version: ChunkVersion,
    ) -> Result<CollectionMetadata> {
        let mut collections = self.collections.write();
        let metadata = collections
            .get_mut(ns)
            .ok_or_else(|| MigrateError::NamespaceNotFound { ns: ns.to_string() })?;

        if !version.newer_than(&metadata.shard_version) {
            return Err(MigrateError::internal(format!(
                "donated version {} does not advance shard version {}",
                version, metadata.shard_version
            )));
        }

        let snapshot = metadata.clone();
        let before = metadata.chunks.len();
        metadata.chunks.retain(|c| c.min != *min || c.max != *max);
        if metadata.chunks.len() == before {
            *metadata = snapshot;
            return Err(MigrateError::internal(format!(
                "cannot donate unowned chunk [{}, {}) of {}",
                min, max, ns
            )));
        }
        metadata.shard_version = version;
        info!(ns, version = %version, "chunk donated, range forgotten locally");
        Ok(snapshot)
    }

    /// Restore the metadata captured before a failed donation.
    pub fn undo_donate_chunk(&self, ns: &str, snapshot: CollectionMetadata) {
        warn!(ns, version = %snapshot.shard_version, "reverting chunk donation");
        self.collections
            .write()
            .insert(ns.to_string(), snapshot);
    }

    /// Mark `[min, max)` as migrating into this shard. Rejected when
    /// the epoch changed or the range overlaps an existing pending or
    /// owned range.
    pub fn note_pending(
        &self,
        ns: &str,
        min: &Document,
        max: &Document,
        epoch: Epoch,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let metadata = collections
            .get_mut(ns)
            .ok_or_else(|| MigrateError::NamespaceNotFound { ns: ns.to_string() })?;

        if metadata.epoch != epoch {
            return Err(MigrateError::PendingRange {
                reason: format!("epoch changed for {} since migration started", ns),
            });
        }

        let min_key = metadata.key_pattern.key_from_bound(min);
        let max_key = metadata.key_pattern.key_from_bound(max);
        let overlaps = metadata.pending.iter().any(|p| {
            metadata.key_pattern.key_from_bound(&p.min) < max_key
                && min_key < metadata.key_pattern.key_from_bound(&p.max)
        });
        if overlaps {
            return Err(MigrateError::PendingRange {
                reason: format!("range [{}, {}) overlaps a pending range", min, max),
            });
        }

        metadata.pending.push(PendingRange {
            min: min.clone(),
            max: max.clone(),
        });
        Ok(())
    }

    /// Drop a pending-incoming marker, e.g. after a failed migration.
    pub fn forget_pending(
        &self,
        ns: &str,
        min: &Document,
        max: &Document,
        epoch: Epoch,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let metadata = collections
            .get_mut(ns)
            .ok_or_else(|| MigrateError::NamespaceNotFound { ns: ns.to_string() })?;

        if metadata.epoch != epoch {
            return Err(MigrateError::PendingRange {
                reason: format!("epoch changed for {}, pending range not tracked", ns),
            });
        }

        let before = metadata.pending.len();
        metadata.pending.retain(|p| p.min != *min || p.max != *max);
        if metadata.pending.len() == before {
            return Err(MigrateError::PendingRange {
                reason: format!("no pending range [{}, {}) on {}", min, max, ns),
            });
        }
        Ok(())
    }

    /// Whether this shard currently serves the document's range.
    pub fn belongs_to_me(&self, ns: &str, doc: &Document) -> bool {
        let collections = self.collections.read();
        let Some(metadata) = collections.get(ns) else {
            return false;
        };
        metadata
            .chunks
            .iter()
            .any(|c| is_in_range(doc, &c.min, &c.max, &metadata.key_pattern))
    }

    /// Whether the document's range is migrating into this shard.
    pub fn is_pending(&self, ns: &str, doc: &Document) -> bool {
        let collections = self.collections.read();
        let Some(metadata) = collections.get(ns) else {
            return false;
        };
        metadata
            .pending
            .iter()
            .any(|p| is_in_range(doc, &p.min, &p.max, &metadata.key_pattern))
    }

    pub fn has_pending(&self, ns: &str) -> bool {
        self.collections
            .read()
            .get(ns)
            .map(|m| !m.pending.is_empty())
            .unwrap_or(false)
    }

    /// First remaining chunk of the namespace, used to bump the donor's
    /// own version at commit time.
    pub fn next_chunk(&self, ns: &str) -> Option<OwnedChunk> {
        self.collections
            .read()
            .get(ns)
            .and_then(|m| m.chunks.first().cloned())
    }
}
