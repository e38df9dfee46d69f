//! Cluster metadata authority seam
//!
//! The donor coordinator commits chunk ownership against an external
//! metadata store with a conditional multi-document update. The store
//! is behind a trait so tests can run the whole protocol in-process and
//! inject the transport faults the commit triage has to handle.

pub mod lock;
pub mod memory;

pub use lock::{DistLock, DistLockService, MemLockService};
pub use memory::{MemMetaStore, MetaFault};

use crate::doc::{canonical_id, Document};
use crate::version::{ChunkVersion, Epoch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chunk row in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub ns: String,
    pub min: Document,
    pub max: Document,
    pub shard: String,
    pub lastmod: ChunkVersion,
}

/// One collection row in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub ns: String,
    pub key_pattern: Document,
    pub epoch: Epoch,
    /// Present when this collection is co-located with (linked to) a
    /// primary collection and migrates as part of its unit.
    pub linked: Option<String>,
}

/// Change-log entry written by migration milestones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub time: DateTime<Utc>,
    pub server: String,
    pub what: String,
    pub ns: String,
    pub details: Value,
}

/// Conditional multi-chunk update, applied atomically iff the
/// precondition still holds.
#[derive(Debug, Clone)]
pub struct MetaUpdate {
    pub updates: Vec<ChunkRecord>,
    pub pre_condition: PreCondition,
}

/// The highest `lastmod` for `ns` must still equal `expected_lastmod`.
#[derive(Debug, Clone)]
pub struct PreCondition {
    pub ns: String,
    pub expected_lastmod: ChunkVersion,
}

/// Commit outcomes the coordinator has to triage separately (§ error
/// taxonomy): a precondition miss and a guaranteed-unsent update roll
/// back; an unknown outcome needs a confirmation read.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("metadata authority unreachable: {0}")]
    Unreachable(String),
    #[error("commit outcome unknown: {0}")]
    Unknown(String),
    #[error("metadata backend error: {0}")]
    Backend(String),
}

/// Chunk id convention: `<ns>-<min>`.
pub fn gen_chunk_id(ns: &str, min: &Document) -> String {
    format!("{}-{}", ns, canonical_min(min))
}

fn canonical_min(min: &Document) -> String {
    let parts: Vec<String> = min
        .0
        .iter()
        .map(|(k, v)| format!("{}_{}", k, canonical_id(v)))
        .collect();
    parts.join("_")
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn collection(&self, ns: &str) -> Result<Option<CollectionRecord>, MetaError>;

    /// Namespaces declaring `linked == ns`.
    async fn linked_collections(&self, ns: &str) -> Result<Vec<String>, MetaError>;

    async fn chunk_by_id(&self, id: &str) -> Result<Option<ChunkRecord>, MetaError>;

    /// The chunk with the highest `lastmod` for a namespace.
    async fn latest_chunk(&self, ns: &str) -> Result<Option<ChunkRecord>, MetaError>;

    /// All chunks of a namespace owned by a shard.
    async fn shard_chunks(&self, ns: &str, shard: &str) -> Result<Vec<ChunkRecord>, MetaError>;

    /// Apply a conditional update batch atomically.
    async fn apply_updates(&self, batch: MetaUpdate) -> Result<(), MetaError>;

    async fn log_change(
        &self,
        server: &str,
        what: &str,
        ns: &str,
        details: Value,
    ) -> Result<(), MetaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gen_chunk_id() {
        let min = Document::from_value(json!({"x": 1})).unwrap();
        assert_eq!(gen_chunk_id("db.coll", &min), "db.coll-x_1");
    }
}
