//! Coordination Store Module
//!
//! Defines the contract the election client needs from a strongly
//! consistent, revisioned key/value store, plus the in-memory store.

mod memory;

pub use memory::{MemoryStore, StoreOp, DEFAULT_HISTORY_LIMIT};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Store-wide revision counter
pub type Revision = i64;

/// Kind of change reported by a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Key was created or overwritten
    Set,
    /// Key was deleted
    Delete,
}

/// A change to a key, as delivered by [`CoordinationStore::wait_for_change`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Path of the changed key
    pub path: String,
    /// Revision at which the change happened
    pub revision: Revision,
    /// New value (empty for deletes)
    pub body: Vec<u8>,
    /// Set or delete
    pub kind: EventKind,
}

impl Event {
    /// Was the key set by this change
    pub fn is_set(&self) -> bool {
        self.kind == EventKind::Set
    }

    /// Was the key deleted by this change
    pub fn is_del(&self) -> bool {
        self.kind == EventKind::Delete
    }

    /// Body interpreted as UTF-8 (lossy)
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Operations the election client requires from a coordination store.
///
/// Implementations must be linearizable: every successful write or delete is
/// stamped with a store-wide revision strictly greater than all previous ones.
/// Conditional operations report a lost race as [`Error::OldRevision`] or
/// [`Error::TooLate`], and a missing key as [`Error::NotFound`].
///
/// [`Error::OldRevision`]: crate::Error::OldRevision
/// [`Error::TooLate`]: crate::Error::TooLate
/// [`Error::NotFound`]: crate::Error::NotFound
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key, returning its value and last modification revision
    async fn read(&self, path: &str) -> Result<(Vec<u8>, Revision)>;

    /// Current store-wide revision
    async fn current_revision(&self) -> Result<Revision>;

    /// Write `value` to `path` unless the key changed at or after `expected`.
    /// Returns the revision of the write.
    async fn compare_and_swap(&self, path: &str, expected: Revision, value: &[u8]) -> Result<Revision>;

    /// Delete `path` unless the key changed at or after `expected`
    async fn compare_and_delete(&self, path: &str, expected: Revision) -> Result<()>;

    /// Block until `path` changes at a revision >= `since`
    async fn wait_for_change(&self, path: &str, since: Revision) -> Result<Event>;
}
