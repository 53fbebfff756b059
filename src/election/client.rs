//! Master Election Client
//!
//! Compare-and-swap election against a [`CoordinationStore`]. The election key
//! holds the identity of the current master; a process becomes master by
//! writing its identity conditioned on the last revision it has processed, so
//! of any number of concurrent attempts the store lets exactly one through.
//! Deleting the key forces a new election.
//!
//! After bootstrap all state changes happen on a single watch task that
//! blocks on the store for changes of the key.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use super::{ElectionConfig, ElectionEventReceiver, Role};
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, Event, Revision};

/// Client for the master election procedure.
///
/// Participating clients may become master; observers only track the
/// current master, but may still force elections.
pub struct MasterElectionClient {
    /// Coordination store
    store: Arc<dyn CoordinationStore>,
    /// Where role transitions are reported
    receiver: Arc<dyn ElectionEventReceiver>,
    /// Election settings
    config: ElectionConfig,
    /// Election key
    path: String,
    /// Who we believe is master (empty if unknown)
    master: RwLock<String>,
    /// Next revision of interest; everything before it has been processed
    last_revision: AtomicI64,
    /// Shutdown signal for the watch task
    shutdown: watch::Sender<bool>,
    /// Raised once the watch task has exited (or was never started)
    stopped: watch::Sender<bool>,
}

/// Raises the stopped flag when dropped, including on panic
struct StopGuard<'a>(&'a watch::Sender<bool>);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl MasterElectionClient {
    /// Join the election described by `config`.
    ///
    /// Reads the election key, adopts the current master or runs an election,
    /// then starts the watch task. A failure to read the initial state is
    /// reported through [`ElectionEventReceiver::election_fatal`]; the client
    /// is still returned but never watches the key.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        config: ElectionConfig,
        receiver: Arc<dyn ElectionEventReceiver>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);
        let client = Arc::new(Self {
            store,
            receiver,
            path: config.path(),
            config,
            master: RwLock::new(String::new()),
            last_revision: AtomicI64::new(0),
            shutdown: shutdown_tx,
            stopped: stopped_tx,
        });

        if client.initialize().await {
            let worker = Arc::clone(&client);
            tokio::spawn(async move { worker.run().await });
        } else {
            client.stopped.send_replace(true);
        }

        Ok(client)
    }

    /// Determine the initial state. Returns false on a fatal error.
    async fn initialize(&self) -> bool {
        match self.store.read(&self.path).await {
            Ok((body, revision)) => {
                self.advance_revision(revision + 1);
                let master = String::from_utf8_lossy(&body).into_owned();
                self.set_master(&master).await;

                // Reported even when the key holds our own identity
                tracing::info!("Current master for {} is {}", self.path, master);
                self.receiver.become_slave(&master).await;
            }
            Err(e) if e.is_not_found() => {
                match self.store.current_revision().await {
                    Ok(revision) => self.advance_revision(revision),
                    Err(e) => {
                        tracing::error!("Failed to read store revision: {}", e);
                        self.receiver.election_fatal(e).await;
                        return false;
                    }
                }

                if self.config.participating {
                    tracing::info!("No master for {}, running election", self.path);
                    self.attempt_election().await;
                } else {
                    tracing::info!("No master for {}, waiting for one", self.path);
                }
            }
            Err(e) => {
                tracing::error!("Failed to read election key {}: {}", self.path, e);
                self.receiver.election_fatal(e).await;
                return false;
            }
        }

        true
    }

    /// Watch the election key until shutdown
    async fn run(self: Arc<Self>) {
        let _stopped = StopGuard(&self.stopped);
        let mut shutdown_rx = self.shutdown.subscribe();
        tracing::info!(
            "Watching {} from revision {}",
            self.path,
            self.last_revision()
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let since = self.last_revision();
            let result = tokio::select! {
                result = self.store.wait_for_change(&self.path, since) => result,
                _ = shutdown_rx.changed() => continue,
            };

            match result {
                Ok(event) => self.handle_event(event).await,
                Err(Error::TooLate(since)) => {
                    tracing::warn!(
                        "Changes of {} since revision {} were compacted, resynchronizing",
                        self.path,
                        since
                    );
                    self.resync().await;
                }
                Err(e) => {
                    tracing::warn!("Waiting for changes of {} failed: {}", self.path, e);
                    self.receiver.election_error(e).await;
                }
            }
        }

        tracing::info!("Election watch for {} stopped", self.path);
    }

    /// Catch up with the key after missing changes
    async fn resync(&self) {
        match self.store.read(&self.path).await {
            Ok((body, revision)) => {
                self.advance_revision(revision + 1);
                let master = String::from_utf8_lossy(&body).into_owned();
                if master != self.config.identity && master != self.current_master().await {
                    tracing::info!("Master for {} is now {}", self.path, master);
                    self.set_master(&master).await;
                    self.receiver.become_slave(&master).await;
                }
            }
            Err(e) if e.is_not_found() => {
                match self.store.current_revision().await {
                    Ok(revision) => self.advance_revision(revision),
                    Err(e) => {
                        tracing::warn!("Failed to read store revision: {}", e);
                        self.receiver.election_error(e).await;
                        return;
                    }
                }
                if self.config.participating {
                    tracing::info!("No master for {}, running election", self.path);
                    self.attempt_election().await;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read master from {}: {}", self.path, e);
                self.receiver.election_error(e).await;
            }
        }
    }

    /// Process one change notification
    async fn handle_event(&self, event: Event) {
        // Some stores report changes of neighbouring keys
        if event.path != self.path {
            tracing::debug!(
                "Skipping change of {} at revision {}",
                event.path,
                event.revision
            );
            self.advance_revision(event.revision + 1);
            return;
        }

        if event.is_del() && self.config.participating {
            tracing::info!(
                "Election key {} deleted at revision {}, running election",
                self.path,
                event.revision
            );
            self.attempt_election().await;
        } else if event.is_set() {
            let master = event.body_str();
            if master != self.config.identity {
                tracing::info!("Master for {} is now {}", self.path, master);
                self.set_master(&master).await;
                self.receiver.become_slave(&master).await;
            } else {
                tracing::debug!("Own identity written at revision {}", event.revision);
            }
        }

        self.advance_revision(event.revision + 1);
    }

    /// Try to become master
    async fn attempt_election(&self) {
        let expected = self.last_revision();
        let identity = self.config.identity.as_bytes();

        match self.store.compare_and_swap(&self.path, expected, identity).await {
            Ok(revision) => {
                let accepted = self.receiver.become_master().await;
                self.advance_revision(revision + 1);

                match accepted {
                    Ok(()) => {
                        tracing::info!(
                            "Elected master for {} at revision {}",
                            self.path,
                            revision
                        );
                        self.set_master(&self.config.identity).await;
                    }
                    Err(e) => {
                        tracing::warn!("Mastership of {} declined ({}), forcing election", self.path, e);
                        if let Err(e) = self.force_election().await {
                            tracing::debug!("Re-election of {} not forced: {}", self.path, e);
                        }
                    }
                }
                return;
            }
            Err(e) if e.is_benign_race() => {
                tracing::debug!("Lost election for {}: {}", self.path, e);
            }
            Err(e) => {
                tracing::warn!("Election write to {} failed: {}", self.path, e);
                self.receiver.election_error(e).await;
            }
        }

        // Adopt whatever is there now
        match self.store.read(&self.path).await {
            Ok((body, revision)) => {
                self.advance_revision(revision + 1);
                let master = String::from_utf8_lossy(&body).into_owned();
                tracing::info!("Master for {} is {}", self.path, master);
                self.set_master(&master).await;
                self.receiver.become_slave(&master).await;
            }
            Err(e) => {
                tracing::warn!("Failed to read master from {}: {}", self.path, e);
                self.receiver.election_error(e).await;
            }
        }
    }

    /// Force a master election right now by deleting the election key.
    ///
    /// Returns the store's answer. A lost race (`OldRevision`, `TooLate`) is
    /// returned but not reported; other failures are also reported through
    /// [`ElectionEventReceiver::election_error`].
    pub async fn force_election(&self) -> Result<()> {
        let expected = self.last_revision();
        let result = self.store.compare_and_delete(&self.path, expected).await;

        match &result {
            Ok(()) => tracing::info!("Forced election for {}", self.path),
            Err(e) if e.is_benign_race() => {
                tracing::debug!("Forced election for {} lost a race: {}", self.path, e);
            }
            Err(e) => {
                tracing::warn!("Failed to force election for {}: {}", self.path, e);
                self.receiver
                    .election_error(Error::Election(format!(
                        "forcing election for {} failed: {}",
                        self.path, e
                    )))
                    .await;
            }
        }

        result
    }

    /// What we believe is the current master. Reads local state only, so it
    /// is cheap but may already be stale; empty if no master was seen yet.
    pub async fn current_master(&self) -> String {
        self.master.read().await.clone()
    }

    /// Read the current master from the store.
    ///
    /// Does not update local state: only the watch task may move the
    /// processed revision forward.
    pub async fn read_current_master(&self) -> Result<String> {
        let (body, _) = self.store.read(&self.path).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Role derived from the believed master
    pub async fn role(&self) -> Role {
        let master = self.master.read().await;
        if master.is_empty() {
            Role::Unknown
        } else if *master == self.config.identity {
            Role::Master
        } else {
            Role::Slave
        }
    }

    /// Next revision the client is interested in
    pub fn last_revision(&self) -> Revision {
        self.last_revision.load(Ordering::SeqCst)
    }

    /// Election key
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Our identity
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Whether this client takes part in elections
    pub fn is_participating(&self) -> bool {
        self.config.participating
    }

    /// Stop the watch task. Store state is left untouched.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until the watch task exits. Returns immediately if it never
    /// started; otherwise only after [`shutdown`](Self::shutdown). Any number
    /// of tasks may wait at once.
    pub async fn sync_wait(&self) {
        let mut stopped = self.stopped.subscribe();
        // The sender lives in self, so this only ends once the flag is raised
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Move the processed revision forward, never backward
    fn advance_revision(&self, revision: Revision) {
        let previous = self.last_revision.fetch_max(revision, Ordering::SeqCst);
        if revision > previous {
            tracing::trace!("{} now at revision {}", self.path, revision);
        }
    }

    async fn set_master(&self, master: &str) {
        let mut current = self.master.write().await;
        if *current != master {
            *current = master.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::election::{ChannelReceiver, ElectionEvent};
    use crate::store::{EventKind, MemoryStore, StoreOp};

    const NAME: &str = "db";
    const KEY: &str = "/ns/service/master/db";

    async fn join(
        store: &Arc<MemoryStore>,
        identity: &str,
        participating: bool,
    ) -> (Arc<MasterElectionClient>, mpsc::Receiver<ElectionEvent>) {
        let (receiver, rx) = ChannelReceiver::new(64);
        join_with(store, identity, participating, receiver, rx).await
    }

    async fn join_with(
        store: &Arc<MemoryStore>,
        identity: &str,
        participating: bool,
        receiver: ChannelReceiver,
        rx: mpsc::Receiver<ElectionEvent>,
    ) -> (Arc<MasterElectionClient>, mpsc::Receiver<ElectionEvent>) {
        let mut config = ElectionConfig::new(NAME, identity);
        if !participating {
            config = config.observer();
        }
        let store: Arc<dyn CoordinationStore> = store.clone();
        let client = MasterElectionClient::start(store, config, Arc::new(receiver))
            .await
            .unwrap();
        (client, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ElectionEvent>) -> ElectionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for election event")
            .expect("event channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<ElectionEvent>) {
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event: {:?}", extra);
    }

    async fn wait_for_revision(client: &MasterElectionClient, at_least: Revision) {
        for _ in 0..100 {
            if client.last_revision() >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("revision stuck at {}", client.last_revision());
    }

    #[tokio::test]
    async fn test_single_participant_becomes_master() {
        let store = Arc::new(MemoryStore::new());
        let (client, mut rx) = join(&store, "10.0.0.1:9000", true).await;

        assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameMaster);
        assert_quiet(&mut rx).await;

        assert_eq!(client.role().await, Role::Master);
        assert_eq!(client.current_master().await, "10.0.0.1:9000");
        assert_eq!(client.read_current_master().await.unwrap(), "10.0.0.1:9000");
        assert_eq!(client.last_revision(), 2);
    }

    #[tokio::test]
    async fn test_existing_master_is_adopted() {
        let store = Arc::new(MemoryStore::new());
        store.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();

        let (client, mut rx) = join(&store, "10.0.0.1:9000", true).await;

        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.5:9000".into())
        );
        assert_quiet(&mut rx).await;

        assert_eq!(client.role().await, Role::Slave);
        assert_eq!(client.read_current_master().await.unwrap(), "10.0.0.5:9000");
    }

    #[tokio::test]
    async fn test_own_identity_at_bootstrap_reports_slave() {
        let store = Arc::new(MemoryStore::new());
        store.compare_and_swap(KEY, 0, b"10.0.0.1:9000").await.unwrap();

        let (_client, mut rx) = join(&store, "10.0.0.1:9000", true).await;

        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.1:9000".into())
        );
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_observer_waits_for_master() {
        let store = Arc::new(MemoryStore::new());
        let (observer, mut orx) = join(&store, "10.0.0.9:9000", false).await;
        assert_quiet(&mut orx).await;
        assert_eq!(observer.role().await, Role::Unknown);

        let (_master, mut mrx) = join(&store, "10.0.0.1:9000", true).await;
        assert_eq!(next_event(&mut mrx).await, ElectionEvent::BecameMaster);

        assert_eq!(
            next_event(&mut orx).await,
            ElectionEvent::BecameSlave("10.0.0.1:9000".into())
        );
        assert_eq!(observer.current_master().await, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_two_participants_race() {
        let store = Arc::new(MemoryStore::new());
        let ((a, mut arx), (b, mut brx)) = tokio::join!(
            join(&store, "10.0.0.1:9000", true),
            join(&store, "10.0.0.2:9000", true)
        );

        let winner = store.read(KEY).await.unwrap().0;
        let winner = String::from_utf8(winner).unwrap();
        let (won_rx, lost_rx) = if winner == a.identity() {
            (&mut arx, &mut brx)
        } else {
            assert_eq!(winner, b.identity());
            (&mut brx, &mut arx)
        };

        assert_eq!(next_event(won_rx).await, ElectionEvent::BecameMaster);
        assert_eq!(next_event(lost_rx).await, ElectionEvent::BecameSlave(winner.clone()));
        assert_quiet(won_rx).await;
        assert_quiet(lost_rx).await;
    }

    #[tokio::test]
    async fn test_many_contenders_elect_exactly_one() {
        use rand::seq::SliceRandom;

        let store = Arc::new(MemoryStore::new());
        let mut identities: Vec<String> = (1..=6).map(|i| format!("10.0.0.{}:9000", i)).collect();
        identities.shuffle(&mut rand::thread_rng());

        let clients = futures::future::join_all(
            identities.iter().map(|identity| join(&store, identity, true)),
        )
        .await;

        let winner = String::from_utf8(store.read(KEY).await.unwrap().0).unwrap();
        let mut masters = 0;
        for (client, mut rx) in clients {
            match next_event(&mut rx).await {
                ElectionEvent::BecameMaster => {
                    masters += 1;
                    assert_eq!(client.identity(), winner);
                }
                ElectionEvent::BecameSlave(master) => assert_eq!(master, winner),
                other => panic!("unexpected event {:?}", other),
            }
            assert_quiet(&mut rx).await;
        }
        assert_eq!(masters, 1);
    }

    #[tokio::test]
    async fn test_refused_mastership_forces_reelection() {
        let store = Arc::new(MemoryStore::new());
        let (receiver, rx) = ChannelReceiver::new(64);
        let receiver = receiver.refuse_mastership(1);
        let (client, mut rx) = join_with(&store, "10.0.0.1:9000", true, receiver, rx).await;

        // Won, refused, key deleted, won again on the next watch cycle
        assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameMaster);
        assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameMaster);
        assert_quiet(&mut rx).await;

        assert_eq!(client.role().await, Role::Master);
        let (body, revision) = store.read(KEY).await.unwrap();
        assert_eq!(body, b"10.0.0.1:9000");
        assert_eq!(revision, 3);
    }

    #[tokio::test]
    async fn test_foreign_write_demotes_master() {
        let store = Arc::new(MemoryStore::new());
        let (client, mut rx) = join(&store, "10.0.0.1:9000", true).await;
        assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameMaster);

        store.compare_and_swap(KEY, 2, b"10.0.0.7:9000").await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.7:9000".into())
        );
        assert_eq!(client.role().await, Role::Slave);
    }

    #[tokio::test]
    async fn test_own_write_is_not_echoed() {
        let store = Arc::new(MemoryStore::new());
        let (client, mut rx) = join(&store, "10.0.0.1:9000", true).await;
        assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameMaster);

        // Rewrite our own identity behind the client's back
        store.compare_and_swap(KEY, 2, b"10.0.0.1:9000").await.unwrap();
        wait_for_revision(&client, 3).await;
        assert_quiet(&mut rx).await;
        assert_eq!(client.role().await, Role::Master);
    }

    #[tokio::test]
    async fn test_observer_forces_election() {
        let store = Arc::new(MemoryStore::new());
        store.compare_and_swap(KEY, 0, b"10.0.0.99:9000").await.unwrap();

        let (_participant, mut prx) = join(&store, "10.0.0.1:9000", true).await;
        let (observer, mut orx) = join(&store, "10.0.0.9:9000", false).await;
        assert_eq!(
            next_event(&mut prx).await,
            ElectionEvent::BecameSlave("10.0.0.99:9000".into())
        );
        assert_eq!(
            next_event(&mut orx).await,
            ElectionEvent::BecameSlave("10.0.0.99:9000".into())
        );

        observer.force_election().await.unwrap();

        assert_eq!(next_event(&mut prx).await, ElectionEvent::BecameMaster);
        assert_eq!(
            next_event(&mut orx).await,
            ElectionEvent::BecameSlave("10.0.0.1:9000".into())
        );
        assert_quiet(&mut prx).await;
    }

    #[tokio::test]
    async fn test_force_election_reports_failures() {
        let store = Arc::new(MemoryStore::new());
        let (observer, mut rx) = join(&store, "10.0.0.9:9000", false).await;

        // Nothing to delete: returned and reported
        assert!(observer.force_election().await.unwrap_err().is_not_found());
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::Error(_)));

        // Lost race: returned, not reported
        store.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();
        store.inject_failure(StoreOp::CompareAndDelete, Error::OldRevision { expected: 0, actual: 1 });
        assert!(observer.force_election().await.unwrap_err().is_benign_race());
        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.5:9000".into())
        );
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_failed_write_falls_back_to_read() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(StoreOp::CompareAndSwap, Error::Store("disk full".into()));

        let (client, mut rx) = join(&store, "10.0.0.1:9000", true).await;

        // Write error reported, then the recovery read finds no key
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::Error(m) if m.contains("disk full")));
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::Error(_)));
        assert_quiet(&mut rx).await;
        assert_eq!(client.role().await, Role::Unknown);

        // The next change is still picked up
        store.compare_and_swap(KEY, 0, b"10.0.0.6:9000").await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.6:9000".into())
        );
    }

    #[tokio::test]
    async fn test_bootstrap_read_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(StoreOp::Read, Error::Network("connection reset".into()));

        let (client, mut rx) = join(&store, "10.0.0.1:9000", true).await;
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::Fatal(_)));

        // No watch task was started
        tokio::time::timeout(Duration::from_secs(1), client.sync_wait())
            .await
            .unwrap();
        store.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_revision_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(StoreOp::CurrentRevision, Error::Network("timeout".into()));

        let (_client, mut rx) = join(&store, "10.0.0.1:9000", true).await;
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::Fatal(_)));
        assert_quiet(&mut rx).await;
        assert!(store.read(KEY).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_wait_errors_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.inject_failure(StoreOp::WaitForChange, Error::Network("connection reset".into()));

        let (_observer, mut rx) = join(&store, "10.0.0.9:9000", false).await;
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::Error(m) if m.contains("reset")));

        store.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.5:9000".into())
        );
    }

    #[tokio::test]
    async fn test_read_current_master_leaves_state_alone() {
        let store = Arc::new(MemoryStore::new());
        store.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();
        let (client, mut rx) = join(&store, "10.0.0.9:9000", false).await;
        assert!(matches!(next_event(&mut rx).await, ElectionEvent::BecameSlave(_)));

        let before = client.last_revision();
        assert_eq!(client.read_current_master().await.unwrap(), "10.0.0.5:9000");
        assert_eq!(client.last_revision(), before);
        assert_eq!(client.current_master().await, "10.0.0.5:9000");
    }

    #[tokio::test]
    async fn test_revision_never_moves_backward() {
        let store = Arc::new(MemoryStore::new());
        let (client, mut rx) = join(&store, "10.0.0.9:9000", false).await;

        let mut seen = vec![client.last_revision()];
        for i in 0..5 {
            let expected = client.last_revision();
            let identity = format!("10.0.0.{}:9000", i + 1);
            store.compare_and_swap(KEY, expected, identity.as_bytes()).await.unwrap();
            assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameSlave(identity));
            wait_for_revision(&client, expected + 1).await;
            seen.push(client.last_revision());
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    }

    #[tokio::test]
    async fn test_shutdown_stops_watch() {
        let store = Arc::new(MemoryStore::new());
        let (client, _rx) = join(&store, "10.0.0.1:9000", true).await;

        client.shutdown();
        tokio::time::timeout(Duration::from_secs(1), client.sync_wait())
            .await
            .unwrap();

        // The key is left for the next election
        assert_eq!(store.read(KEY).await.unwrap().0, b"10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_sync_wait_serves_many_callers() {
        let store = Arc::new(MemoryStore::new());
        let (client, _rx) = join(&store, "10.0.0.1:9000", true).await;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.sync_wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        client.shutdown();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        client.sync_wait().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let (receiver, _rx) = ChannelReceiver::new(1);
        let result = MasterElectionClient::start(
            store,
            ElectionConfig::new("", "10.0.0.1:9000"),
            Arc::new(receiver),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    /// Store that reports one change of an unrelated key before behaving normally
    struct NoisyStore {
        inner: MemoryStore,
        foreign: std::sync::Mutex<Option<Event>>,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for NoisyStore {
        async fn read(&self, path: &str) -> Result<(Vec<u8>, Revision)> {
            self.inner.read(path).await
        }

        async fn current_revision(&self) -> Result<Revision> {
            self.inner.current_revision().await
        }

        async fn compare_and_swap(&self, path: &str, expected: Revision, value: &[u8]) -> Result<Revision> {
            self.inner.compare_and_swap(path, expected, value).await
        }

        async fn compare_and_delete(&self, path: &str, expected: Revision) -> Result<()> {
            self.inner.compare_and_delete(path, expected).await
        }

        async fn wait_for_change(&self, path: &str, since: Revision) -> Result<Event> {
            let foreign = self.foreign.lock().unwrap().take();
            match foreign {
                Some(event) => Ok(event),
                None => self.inner.wait_for_change(path, since).await,
            }
        }
    }

    /// Store whose first wait applies a change and reports it as compacted
    struct CompactingStore {
        inner: MemoryStore,
        /// New value, or None to delete
        lost: std::sync::Mutex<Option<Option<Vec<u8>>>>,
    }

    impl CompactingStore {
        fn new(inner: MemoryStore, lost: Option<Vec<u8>>) -> Self {
            Self {
                inner,
                lost: std::sync::Mutex::new(Some(lost)),
            }
        }
    }

    #[async_trait::async_trait]
    impl CoordinationStore for CompactingStore {
        async fn read(&self, path: &str) -> Result<(Vec<u8>, Revision)> {
            self.inner.read(path).await
        }

        async fn current_revision(&self) -> Result<Revision> {
            self.inner.current_revision().await
        }

        async fn compare_and_swap(&self, path: &str, expected: Revision, value: &[u8]) -> Result<Revision> {
            self.inner.compare_and_swap(path, expected, value).await
        }

        async fn compare_and_delete(&self, path: &str, expected: Revision) -> Result<()> {
            self.inner.compare_and_delete(path, expected).await
        }

        async fn wait_for_change(&self, path: &str, since: Revision) -> Result<Event> {
            let lost = self.lost.lock().unwrap().take();
            match lost {
                Some(change) => {
                    let next = self.inner.current_revision().await? + 1;
                    match change {
                        Some(value) => {
                            self.inner.compare_and_swap(path, next, &value).await?;
                        }
                        None => self.inner.compare_and_delete(path, next).await?,
                    }
                    Err(Error::TooLate(since))
                }
                None => self.inner.wait_for_change(path, since).await,
            }
        }
    }

    async fn join_compacting(
        store: &Arc<CompactingStore>,
        identity: &str,
    ) -> (Arc<MasterElectionClient>, mpsc::Receiver<ElectionEvent>) {
        let (receiver, rx) = ChannelReceiver::new(8);
        let client = MasterElectionClient::start(
            store.clone(),
            ElectionConfig::new(NAME, identity),
            Arc::new(receiver),
        )
        .await
        .unwrap();
        (client, rx)
    }

    #[tokio::test]
    async fn test_compacted_change_is_recovered_by_read() {
        let inner = MemoryStore::new();
        inner.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();
        let store = Arc::new(CompactingStore::new(inner, Some(b"10.0.0.6:9000".to_vec())));

        let (client, mut rx) = join_compacting(&store, "10.0.0.1:9000").await;
        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.5:9000".into())
        );

        // Not reported as an error; the missed master is picked up instead
        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.6:9000".into())
        );
        assert_quiet(&mut rx).await;
        wait_for_revision(&client, 3).await;
        assert_eq!(client.current_master().await, "10.0.0.6:9000");
    }

    #[tokio::test]
    async fn test_compacted_delete_triggers_election() {
        let inner = MemoryStore::new();
        inner.compare_and_swap(KEY, 0, b"10.0.0.5:9000").await.unwrap();
        let store = Arc::new(CompactingStore::new(inner, None));

        let (client, mut rx) = join_compacting(&store, "10.0.0.1:9000").await;
        assert_eq!(
            next_event(&mut rx).await,
            ElectionEvent::BecameSlave("10.0.0.5:9000".into())
        );
        assert_eq!(next_event(&mut rx).await, ElectionEvent::BecameMaster);
        assert_quiet(&mut rx).await;
        assert_eq!(client.role().await, Role::Master);
    }

    #[tokio::test]
    async fn test_foreign_path_events_are_skipped() {
        let store = Arc::new(NoisyStore {
            inner: MemoryStore::new(),
            foreign: std::sync::Mutex::new(Some(Event {
                path: "/ns/service/master/db-replica".to_string(),
                revision: 10,
                body: b"10.0.0.66:9000".to_vec(),
                kind: EventKind::Set,
            })),
        });

        let (receiver, mut rx) = ChannelReceiver::new(8);
        let client = MasterElectionClient::start(
            store.clone(),
            ElectionConfig::new(NAME, "10.0.0.9:9000").observer(),
            Arc::new(receiver),
        )
        .await
        .unwrap();

        wait_for_revision(&client, 11).await;
        assert_eq!(client.last_revision(), 11);
        assert_quiet(&mut rx).await;
        assert_eq!(client.role().await, Role::Unknown);
    }
}
