//! Migration error taxonomy

use crate::version::ChunkVersion;
use serde_json::Value;

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Errors surfaced by the migration engine.
///
/// Everything before the critical-section commit rolls back cleanly and
/// is safe to retry after the caller refreshes its view; divergence
/// after an ambiguous commit is not represented here because the
/// process terminates instead.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("migration already in progress")]
    MigrationActive,

    #[error("collection metadata could not be locked, held by {who}")]
    LockContention { who: String },

    #[error("boundaries are outdated (likely a split occurred): [{curr_min}, {curr_max}) != requested [{requested_min}, {requested_max})")]
    StaleBounds {
        curr_min: Value,
        curr_max: Value,
        requested_min: Value,
        requested_max: Value,
    },

    #[error("location is outdated (likely balance or migrate occurred): chunk is at {official} and not at {requested}")]
    StaleOwner { official: String, requested: String },

    #[error("official version less than mine? official {official}, mine {mine}")]
    StaleVersion {
        official: ChunkVersion,
        mine: ChunkVersion,
    },

    #[error("chunk too big to move: estimated {estimated_bytes} bytes, maximum {max_bytes}")]
    ChunkTooBig {
        estimated_bytes: u64,
        max_bytes: u64,
    },

    #[error("aborting migrate because too much memory used: {used_bytes} bytes")]
    MemoryLimit { used_bytes: u64 },

    #[error("recipient shard reported failure: {cause}")]
    RecipientFailed { cause: String },

    #[error("could not contact shard {shard}: {reason}")]
    Transport { shard: String, reason: String },

    #[error("metadata authority unreachable: {reason}")]
    MetaUnreachable { reason: String },

    #[error("namespace not found: {ns}")]
    NamespaceNotFound { ns: String },

    #[error("cannot migrate chunk, local document with _id {id} conflicts in namespace {ns}")]
    DuplicateId { ns: String, id: Value },

    #[error("pending range conflict: {reason}")]
    PendingRange { reason: String },

    #[error("operation interrupted")]
    Interrupted,

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    pub fn internal(reason: impl Into<String>) -> Self {
        MigrateError::Internal {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        MigrateError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// True when the balancer should split the chunk and retry.
    pub fn split_hint(&self) -> bool {
        matches!(self, MigrateError::MemoryLimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrateError::LockContention {
            who: "shard0002".to_string(),
        };
        assert!(err.to_string().contains("shard0002"));

        let err = MigrateError::ChunkTooBig {
            estimated_bytes: 10240,
            max_bytes: 1024,
        };
        assert!(err.to_string().contains("10240"));
    }

    #[test]
    fn test_split_hint() {
        assert!(MigrateError::MemoryLimit { used_bytes: 1 }.split_hint());
        assert!(!MigrateError::MigrationActive.split_hint());
    }
}
