//! Sharding write hooks
//!
//! The storage engine invokes the registered listener for every data
//! mutation while it still holds the collection write lock, so capture
//! is synchronous with the mutation and consistent with durable state.

use crate::doc::Document;
use crate::store::collection::RecordId;
use serde_json::Value;

/// Kind of mutation being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    /// Replication bookkeeping, never user data.
    Noop,
    /// Administrative command.
    Command,
}

/// Context of one mutation, valid only for the duration of the hook
/// call. `find_by_id` reads through the write lock already held by the
/// mutating thread.
pub struct ModContext<'a> {
    pub kind: OpKind,
    pub ns: &'a str,
    /// Insert: the full new document. Update: the written post-image.
    /// Delete: an id-only document.
    pub doc: &'a Document,
    /// Explicit id pattern when the mutation carries one.
    pub id_pattern: Option<&'a Value>,
    /// Set for deletes issued by migration cleanup of an older chunk;
    /// those are not user data and must not be captured.
    pub not_in_active_chunk: bool,
    pub find_by_id: &'a dyn Fn(&Value) -> Option<Document>,
}

impl ModContext<'_> {
    /// The `_id` this mutation addresses.
    pub fn id(&self) -> Option<Value> {
        match self.id_pattern {
            Some(v) => Some(v.clone()),
            None => self.doc.id().cloned(),
        }
    }
}

/// Listener registered by the sharding layer.
pub trait ShardingHooks: Send + Sync {
    fn on_mod(&self, ctx: &ModContext<'_>);
    fn on_about_to_delete(&self, ns: &str, loc: RecordId);
}

/// No-op listener installed until sharding is initialized.
pub struct NullHooks;

impl ShardingHooks for NullHooks {
    fn on_mod(&self, _ctx: &ModContext<'_>) {}
    fn on_about_to_delete(&self, _ns: &str, _loc: RecordId) {}
}
