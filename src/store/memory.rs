//! In-Memory Coordination Store
//!
//! Single-process implementation of [`CoordinationStore`]. Every mutation is
//! serialized under one lock, so revisions are strictly increasing and CAS
//! checks are linearizable. Backs the store server and the test suite.
//!
//! Change history is kept in a bounded window. A wait only fails with
//! `TooLate` when a change of the waited-for key has actually been dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::{watch, RwLock};

use super::{CoordinationStore, Event, EventKind, Revision};
use crate::error::{Error, Result};

/// Changes retained for waiters unless configured otherwise
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Store operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Read,
    CurrentRevision,
    CompareAndSwap,
    CompareAndDelete,
    WaitForChange,
}

/// A live key
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: Revision,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Revision of the last mutation
    revision: Revision,
    keys: HashMap<String, Entry>,
    /// Retained changes, oldest first
    history: VecDeque<Event>,
    /// Newest dropped revision per path
    dropped: HashMap<String, Revision>,
}

impl StoreState {
    fn check_expected(&self, path: &str, expected: Revision) -> Result<()> {
        if let Some(entry) = self.keys.get(path) {
            if entry.revision >= expected {
                return Err(Error::OldRevision {
                    expected,
                    actual: entry.revision,
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, path: &str, body: Vec<u8>, kind: EventKind, limit: usize) -> Revision {
        self.revision += 1;
        self.history.push_back(Event {
            path: path.to_string(),
            revision: self.revision,
            body,
            kind,
        });
        while self.history.len() > limit {
            self.drop_oldest();
        }
        self.revision
    }

    fn drop_oldest(&mut self) {
        if let Some(event) = self.history.pop_front() {
            self.dropped.insert(event.path, event.revision);
        }
    }

    /// First retained change of `path` at or after `since`
    fn find_change(&self, path: &str, since: Revision) -> Result<Option<Event>> {
        if let Some(&dropped) = self.dropped.get(path) {
            if dropped >= since {
                return Err(Error::TooLate(since));
            }
        }

        let start = self.history.partition_point(|ev| ev.revision < since);
        Ok(self
            .history
            .range(start..)
            .find(|ev| ev.path == path)
            .cloned())
    }
}

/// In-memory coordination store with failure injection
pub struct MemoryStore {
    state: RwLock<StoreState>,
    /// Maximum number of retained changes
    history_limit: usize,
    /// Publishes the latest revision to blocked waiters
    revision_tx: watch::Sender<Revision>,
    /// Errors queued per operation, returned before touching state
    failures: Mutex<HashMap<StoreOp, VecDeque<Error>>>,
}

impl MemoryStore {
    /// Create an empty store at revision 0
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create an empty store retaining at most `limit` changes
    pub fn with_history_limit(limit: usize) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(StoreState::default()),
            history_limit: limit.max(1),
            revision_tx,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Number of waits currently blocked in the store
    pub fn pending_waiters(&self) -> usize {
        self.revision_tx.receiver_count()
    }

    /// Queue an error to be returned by the next call of `op`
    pub fn inject_failure(&self, op: StoreOp, error: Error) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.entry(op).or_default().push_back(error);
    }

    /// Drop history older than `before`. Waits that would need a dropped
    /// change fail with `TooLate` afterwards.
    pub async fn compact(&self, before: Revision) {
        let mut state = self.state.write().await;
        let mut count = 0;
        while state.history.front().is_some_and(|ev| ev.revision < before) {
            state.drop_oldest();
            count += 1;
        }
        if count > 0 {
            tracing::debug!("Compacted {} changes below revision {}", count, before);
        }
    }

    fn take_failure(&self, op: StoreOp) -> Result<()> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn publish(&self, revision: Revision) {
        self.revision_tx.send_replace(revision);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<(Vec<u8>, Revision)> {
        self.take_failure(StoreOp::Read)?;
        let state = self.state.read().await;
        match state.keys.get(path) {
            Some(entry) => Ok((entry.value.clone(), entry.revision)),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    async fn current_revision(&self) -> Result<Revision> {
        self.take_failure(StoreOp::CurrentRevision)?;
        Ok(self.state.read().await.revision)
    }

    async fn compare_and_swap(&self, path: &str, expected: Revision, value: &[u8]) -> Result<Revision> {
        self.take_failure(StoreOp::CompareAndSwap)?;
        let revision = {
            let mut state = self.state.write().await;
            state.check_expected(path, expected)?;
            let revision = state.record(path, value.to_vec(), EventKind::Set, self.history_limit);
            state.keys.insert(
                path.to_string(),
                Entry {
                    value: value.to_vec(),
                    revision,
                },
            );
            revision
        };

        tracing::trace!("Set {} at revision {}", path, revision);
        self.publish(revision);
        Ok(revision)
    }

    async fn compare_and_delete(&self, path: &str, expected: Revision) -> Result<()> {
        self.take_failure(StoreOp::CompareAndDelete)?;
        let revision = {
            let mut state = self.state.write().await;
            if !state.keys.contains_key(path) {
                return Err(Error::NotFound(path.to_string()));
            }
            state.check_expected(path, expected)?;
            state.keys.remove(path);
            state.record(path, Vec::new(), EventKind::Delete, self.history_limit)
        };

        tracing::trace!("Deleted {} at revision {}", path, revision);
        self.publish(revision);
        Ok(())
    }

    async fn wait_for_change(&self, path: &str, since: Revision) -> Result<Event> {
        self.take_failure(StoreOp::WaitForChange)?;

        // Subscribe before scanning so a change landing in between still wakes us
        let mut revision_rx = self.revision_tx.subscribe();
        loop {
            if let Some(event) = self.state.read().await.find_change(path, since)? {
                return Ok(event);
            }

            if revision_rx.changed().await.is_err() {
                return Err(Error::ShuttingDown);
            }
        }
    }
}
