//! Master Election Module
//!
//! Elects a single master among cooperating processes using compare-and-swap
//! writes against a coordination store, and keeps every participant informed
//! about who the current master is.

mod client;
pub mod receiver;

pub use client::MasterElectionClient;
pub use receiver::{ChannelReceiver, ElectionEvent, ElectionEventReceiver, LoggingReceiver};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Namespace election keys live under unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "/ns/service/master";

/// Role of this process in an election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// No master observed yet
    Unknown,
    /// Another process is master
    Slave,
    /// This process is master
    Master,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unknown => write!(f, "UNKNOWN"),
            Role::Slave => write!(f, "SLAVE"),
            Role::Master => write!(f, "MASTER"),
        }
    }
}

/// Settings of one election client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Namespace of the election key
    pub namespace: String,
    /// Election name
    pub name: String,
    /// Identity published when this process is master (host:port)
    pub identity: String,
    /// Whether this process may become master
    pub participating: bool,
}

impl ElectionConfig {
    /// Participating client for election `name`
    pub fn new(name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.into(),
            identity: identity.into(),
            participating: true,
        }
    }

    /// Only observe the election, never become master
    pub fn observer(mut self) -> Self {
        self.participating = false;
        self
    }

    /// Use a different key namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Path of the election key
    pub fn path(&self) -> String {
        format!("{}/{}", self.namespace.trim_end_matches('/'), self.name)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Config(format!("invalid election name '{}'", self.name)));
        }
        if self.identity.is_empty() {
            return Err(Error::Config("identity cannot be empty".into()));
        }
        Ok(())
    }
}
