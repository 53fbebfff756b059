//! WolfElect - Master Election over a Coordination Store
//!
//! A Rust library and CLI that lets a set of cooperating processes agree on
//! exactly one master at a time, using compare-and-swap writes against a
//! strongly-consistent coordination store.
//!
//! # Architecture
//!
//! Every process runs a [`MasterElectionClient`](election::MasterElectionClient).
//! The client reads the election key on startup, then watches it for changes
//! and runs a new election whenever the key is deleted. Writes carry the last
//! revision the client has processed, so a client that acted on stale state
//! always loses to the store.
//!
//! # Features
//!
//! - CAS-based election with forced re-election
//! - Observer clients that track the master without competing
//! - Pluggable event receivers for role transitions
//! - In-memory coordination store with a framed TCP protocol

pub mod config;
pub mod error;
pub mod store;
pub mod network;
pub mod election;

pub use config::WolfElectConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfElectConfig;
    pub use crate::error::{Error, Result};
    pub use crate::election::{ElectionConfig, ElectionEventReceiver, MasterElectionClient, Role};
    pub use crate::store::{CoordinationStore, Event, MemoryStore, Revision};
    pub use crate::network::{RemoteStore, RemoteStoreConfig, StoreServer};
}
