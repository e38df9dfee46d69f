//! Chunk versions and migration identities
//!
//! A chunk version is `(major, minor)` under a collection epoch. Major
//! increments on ownership change, minor on same-shard mutations.
//! Versions are comparable only when their epochs match.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque collection epoch, stable unless the collection is dropped
/// and recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(Uuid);

impl Epoch {
    pub fn new() -> Self {
        Epoch(Uuid::new_v4())
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Epoch::new()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Globally unique migration identity, threaded through every RPC so
/// the recipient can reject stale or crossed-over requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationId(Uuid);

impl MigrationId {
    pub fn new() -> Self {
        MigrationId(Uuid::new_v4())
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        MigrationId::new()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Shard-local chunk version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersion {
    major: u32,
    minor: u32,
    epoch: Epoch,
}

impl ChunkVersion {
    pub fn new(major: u32, minor: u32, epoch: Epoch) -> Self {
        ChunkVersion {
            major,
            minor,
            epoch,
        }
    }

    pub fn zero(epoch: Epoch) -> Self {
        ChunkVersion::new(0, 0, epoch)
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Combined form used for metadata `lastmod` comparisons.
    pub fn to_u64(&self) -> u64 {
        ((self.major as u64) << 32) | self.minor as u64
    }

    /// Ownership change: bump major, reset minor.
    pub fn inc_major(&mut self) {
        self.major += 1;
        self.minor = 0;
    }

    /// Same-shard mutation: bump minor.
    pub fn inc_minor(&mut self) {
        self.minor += 1;
    }

    pub fn is_zero_major(&self) -> bool {
        self.major == 0
    }

    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Exact equality including epoch; the commit confirmation check.
    pub fn is_equivalent_to(&self, other: &ChunkVersion) -> bool {
        self.same_epoch(other) && self.major == other.major && self.minor == other.minor
    }

    /// Strictly newer than `other` within the same epoch. Versions from
    /// different epochs never satisfy this.
    pub fn newer_than(&self, other: &ChunkVersion) -> bool {
        self.same_epoch(other) && self.to_u64() > other.to_u64()
    }

    /// Strictly older than `other` within the same epoch.
    pub fn older_than(&self, other: &ChunkVersion) -> bool {
        other.newer_than(self)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}
