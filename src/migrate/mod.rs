//! Chunk migration state machines
//!
//! The donor side captures writes and serves clone/transfer pulls; the
//! recipient side drives the receive state machine; the coordinator
//! runs the donor protocol end to end, including the critical-section
//! commit against the metadata authority.

pub mod coordinator;
pub mod donor;
pub mod donor_group;
pub mod recipient;
pub mod recipient_group;

pub use coordinator::move_chunk;
pub use donor::DonorSession;
pub use donor_group::{DonorGroup, DonorGuard};
pub use recipient::RecipientSession;
pub use recipient_group::RecipientGroup;

use crate::doc::Document;
use crate::meta::MetaStore;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Step timing recorder. Each protocol step's duration lands in the
/// change-log entry written when the move finishes, together with any
/// abort notes.
pub(crate) struct MoveTiming {
    side: &'static str,
    ns: String,
    details: Map<String, Value>,
    next: u32,
    total: u32,
    next_note: u32,
    timer: Instant,
}

impl MoveTiming {
    pub(crate) fn new(
        side: &'static str,
        ns: &str,
        min: &Document,
        max: &Document,
        total: u32,
    ) -> Self {
        let mut details = Map::new();
        details.insert("min".to_string(), min.to_value());
        details.insert("max".to_string(), max.to_value());
        MoveTiming {
            side,
            ns: ns.to_string(),
            details,
            next: 0,
            total,
            next_note: 0,
            timer: Instant::now(),
        }
    }

    pub(crate) fn done(&mut self, step: u32) {
        debug_assert_eq!(step, self.next + 1);
        debug_assert!(step <= self.total);
        self.next = step;
        let label = format!("step {} of {}", step, self.total);
        self.details.insert(
            label,
            Value::from(self.timer.elapsed().as_millis() as u64),
        );
        self.timer = Instant::now();
    }

    pub(crate) fn note(&mut self, text: &str) {
        let field = if self.next_note == 0 {
            "note".to_string()
        } else {
            format!("note{}", self.next_note)
        };
        self.next_note += 1;
        self.details.insert(field, Value::from(text));
    }

    /// Write the `moveChunk.<side>` change-log entry. Aborted runs are
    /// annotated with the step they died in and the error text.
    pub(crate) async fn finish(
        mut self,
        meta: &Arc<dyn MetaStore>,
        server: &str,
        errmsg: Option<&str>,
    ) {
        if self.next != self.total {
            self.note("aborted");
        }
        if let Some(errmsg) = errmsg {
            self.note(errmsg);
            warn!(ns = %self.ns, errmsg, "got error doing chunk migrate");
        }
        let what = format!("moveChunk.{}", self.side);
        if let Err(e) = meta
            .log_change(server, &what, &self.ns, Value::Object(self.details))
            .await
        {
            warn!(what = %what, error = %e, "couldn't record timing for moveChunk");
        }
    }
}
