//! Migration command payloads and the shard-to-shard client seam
//!
//! Every RPC of the protocol takes one structured payload and returns a
//! structured result. The transport itself is an external collaborator;
//! `ShardLink` is the client-side contract the two state machines use,
//! and tests wire it up with an in-process loopback.

use crate::doc::Document;
use crate::error::Result;
use crate::store::{CollectionOptions, IndexSpec};
use crate::version::MigrationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Recipient-side migration phase, also the wire encoding used by
/// status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationPhase {
    Ready,
    Clone,
    Catchup,
    Steady,
    CommitStart,
    Done,
    Fail,
    Abort,
}

impl MigrationPhase {
    /// Terminal failure phases dominate aggregate reporting.
    pub fn is_failed(&self) -> bool {
        matches!(self, MigrationPhase::Fail | MigrationPhase::Abort)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Ready => "ready",
            MigrationPhase::Clone => "clone",
            MigrationPhase::Catchup => "catchup",
            MigrationPhase::Steady => "steady",
            MigrationPhase::CommitStart => "commitStart",
            MigrationPhase::Done => "done",
            MigrationPhase::Fail => "fail",
            MigrationPhase::Abort => "abort",
        }
    }
}

/// `moveChunk`: client → donor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveChunkRequest {
    pub ns: String,
    pub from: String,
    pub to: String,
    pub min: Document,
    pub max: Document,
    pub shard_id: String,
    pub max_chunk_size_bytes: u64,
    #[serde(default)]
    pub secondary_throttle: bool,
    #[serde(default)]
    pub wait_for_delete: bool,
    #[serde(default)]
    pub configdb: Option<String>,
}

/// `_recvChunkStart`: donor → recipient, seeds the migration identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvChunkStart {
    pub ns: String,
    pub from: String,
    pub min: Document,
    pub max: Document,
    pub shard_key_pattern: Document,
    pub config_server: String,
    pub secondary_throttle: bool,
    pub migration_id: MigrationId,
}

/// `_recvChunkStartOne`: donor → recipient, one per linked namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvChunkStartOne {
    pub ns: String,
    pub migration_id: MigrationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedReply {
    pub started: bool,
}

/// Per-group progress counters summed over sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateCounts {
    pub cloned: u64,
    pub cloned_bytes: u64,
    pub catchup: u64,
    pub steady: u64,
}

/// `_recvChunkStatus` / `_recvChunkCommit` / `_recvChunkAbort` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub active: bool,
    pub ns: String,
    pub from: String,
    pub min: Document,
    pub max: Document,
    pub shard_key_pattern: Document,
    pub state: MigrationPhase,
    pub counts: MigrateCounts,
    #[serde(default)]
    pub errmsg: Option<String>,
}

/// `_recvChunkCommit` result: ok iff every session reached done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReply {
    pub ok: bool,
    pub status: StatusReply,
}

/// `_migrateClone` reply; an empty `objects` array signals completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneBatch {
    pub objects: Vec<Document>,
}

/// `_transferMods` reply: captured deletions (id-only) and reloads
/// (full documents), plus the byte count drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModBatch {
    pub deleted: Vec<Document>,
    pub reload: Vec<Document>,
    pub size: u64,
}

impl ModBatch {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Collection shape the recipient replicates before cloning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub options: CollectionOptions,
    pub key_pattern: Document,
    pub indexes: Vec<IndexSpec>,
}

/// Client to one peer shard.
#[async_trait]
pub trait ShardLink: Send + Sync {
    async fn recv_chunk_start(&self, req: RecvChunkStart) -> Result<StartedReply>;
    async fn recv_chunk_start_one(&self, req: RecvChunkStartOne) -> Result<StartedReply>;
    async fn recv_chunk_status(&self) -> Result<StatusReply>;
    async fn recv_chunk_commit(&self) -> Result<CommitReply>;
    async fn recv_chunk_abort(&self) -> Result<StatusReply>;
    async fn migrate_clone(&self, ns: &str) -> Result<CloneBatch>;
    async fn transfer_mods(&self, ns: &str) -> Result<ModBatch>;
    async fn collection_description(&self, ns: &str) -> Result<Option<CollectionDescription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering_matches_progress() {
        assert!(MigrationPhase::Ready < MigrationPhase::Clone);
        assert!(MigrationPhase::Clone < MigrationPhase::Catchup);
        assert!(MigrationPhase::Steady < MigrationPhase::CommitStart);
        assert!(MigrationPhase::CommitStart < MigrationPhase::Done);
        assert!(MigrationPhase::Done < MigrationPhase::Fail);
        assert!(MigrationPhase::Fail.is_failed());
        assert!(MigrationPhase::Abort.is_failed());
        assert!(!MigrationPhase::Done.is_failed());
    }

    #[test]
    fn test_phase_wire_encoding() {
        let json = serde_json::to_string(&MigrationPhase::CommitStart).unwrap();
        assert_eq!(json, "\"commitStart\"");
        assert_eq!(MigrationPhase::CommitStart.as_str(), "commitStart");
    }

    #[test]
    fn test_request_defaults() {
        let req: MoveChunkRequest = serde_json::from_value(serde_json::json!({
            "ns": "db.c",
            "from": "shard0001",
            "to": "shard0002",
            "min": {"x": 1},
            "max": {"x": 5},
            "shard_id": "db.c-x_1",
            "max_chunk_size_bytes": 1048576u64,
        }))
        .unwrap();
        assert!(!req.secondary_throttle);
        assert!(!req.wait_for_delete);
        assert!(req.configdb.is_none());
    }
}
