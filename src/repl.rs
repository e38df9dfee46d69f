//! Replication seam
//!
//! The recipient refuses to finish a migration until the documents it
//! applied are replicated to enough secondaries and, when durability is
//! on, flushed to the journal. Replication itself lives outside this
//! crate; the trait below is the contract the state machine needs.

use std::sync::atomic::{AtomicBool, Ordering};

/// Position in the replication log. The storage engine's op clock
/// serves as the op time for in-memory deployments.
pub type OpTime = u64;

pub trait Replication: Send + Sync {
    /// Whether any replication is configured at all.
    fn enabled(&self) -> bool;

    /// Number of replicas required for "replicated enough".
    fn majority(&self) -> u32;

    /// True once `op` has reached `required` replicas.
    fn op_replicated_enough(&self, op: OpTime, required: u32) -> bool;

    /// Force a journal commit; returns false when durability is off.
    fn flush_journal(&self) -> bool;
}

/// Standalone deployment: no secondaries, nothing to wait for.
pub struct NoReplication;

impl Replication for NoReplication {
    fn enabled(&self) -> bool {
        false
    }

    fn majority(&self) -> u32 {
        0
    }

    fn op_replicated_enough(&self, _op: OpTime, _required: u32) -> bool {
        true
    }

    fn flush_journal(&self) -> bool {
        false
    }
}

/// Fixed-topology replication double for tests: a majority size and a
/// switch deciding whether secondaries are caught up.
pub struct StaticReplication {
    majority: u32,
    caught_up: AtomicBool,
    durable: bool,
}

impl StaticReplication {
    pub fn new(majority: u32, durable: bool) -> Self {
        StaticReplication {
            majority,
            caught_up: AtomicBool::new(true),
            durable,
        }
    }

    pub fn set_caught_up(&self, caught_up: bool) {
        self.caught_up.store(caught_up, Ordering::SeqCst);
    }
}

impl Replication for StaticReplication {
    fn enabled(&self) -> bool {
        true
    }

    fn majority(&self) -> u32 {
        self.majority
    }

    fn op_replicated_enough(&self, _op: OpTime, required: u32) -> bool {
        required == 0 || self.caught_up.load(Ordering::SeqCst)
    }

    fn flush_journal(&self) -> bool {
        self.durable
    }
}
