//! Election Event Receivers
//!
//! The owning process learns about role transitions through an
//! [`ElectionEventReceiver`]. Callbacks are invoked from the client's watch
//! task, one at a time, so a slow receiver delays the election loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Notifications about changes of the master state
#[async_trait::async_trait]
pub trait ElectionEventReceiver: Send + Sync {
    /// Called after this process won the election. Returning an error
    /// gives up the mastership and forces a new election.
    async fn become_master(&self) -> Result<()>;

    /// Called every time another process is confirmed as master, including
    /// repeated notifications about the same master and the initial
    /// discovery. This is also how a master learns it has been demoted.
    async fn become_slave(&self, new_master: &str);

    /// Non-fatal error; the election keeps running
    async fn election_error(&self, err: Error);

    /// Fatal error during startup; the client will not watch the election
    async fn election_fatal(&self, err: Error);
}

/// A callback, as delivered by [`ChannelReceiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    BecameMaster,
    BecameSlave(String),
    Error(String),
    Fatal(String),
}

/// Forwards every callback into an mpsc channel
pub struct ChannelReceiver {
    tx: mpsc::Sender<ElectionEvent>,
    /// Remaining `become_master` calls to refuse
    refusals: AtomicUsize,
}

impl ChannelReceiver {
    /// Create a receiver and the channel its events arrive on
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ElectionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let receiver = Self {
            tx,
            refusals: AtomicUsize::new(0),
        };
        (receiver, rx)
    }

    /// Refuse the next `count` mastership grants
    pub fn refuse_mastership(self, count: usize) -> Self {
        self.refusals.store(count, Ordering::SeqCst);
        self
    }

    async fn emit(&self, event: ElectionEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("Election event dropped, nobody is listening");
        }
    }
}

#[async_trait::async_trait]
impl ElectionEventReceiver for ChannelReceiver {
    async fn become_master(&self) -> Result<()> {
        self.emit(ElectionEvent::BecameMaster).await;

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Election("mastership refused".into()));
        }
        Ok(())
    }

    async fn become_slave(&self, new_master: &str) {
        self.emit(ElectionEvent::BecameSlave(new_master.to_string())).await;
    }

    async fn election_error(&self, err: Error) {
        self.emit(ElectionEvent::Error(err.to_string())).await;
    }

    async fn election_fatal(&self, err: Error) {
        self.emit(ElectionEvent::Fatal(err.to_string())).await;
    }
}

/// Logs every transition
pub struct LoggingReceiver {
    name: String,
}

impl LoggingReceiver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl ElectionEventReceiver for LoggingReceiver {
    async fn become_master(&self) -> Result<()> {
        tracing::info!("[{}] This node is now MASTER", self.name);
        Ok(())
    }

    async fn become_slave(&self, new_master: &str) {
        tracing::info!("[{}] Following master {}", self.name, new_master);
    }

    async fn election_error(&self, err: Error) {
        tracing::warn!("[{}] Election error: {}", self.name, err);
    }

    async fn election_fatal(&self, err: Error) {
        tracing::error!("[{}] Election failed: {}", self.name, err);
    }
}
