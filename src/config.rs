//! WolfElect Configuration
//!
//! This module provides configuration structures for election
//! participants, observers and the store server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::election::ElectionConfig;
use crate::network::RemoteStoreConfig;

/// Main WolfElect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfElectConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Election configuration
    pub election: ElectionSection,

    /// Coordination store connection configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Store server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity published when this node is master (host:port)
    pub identity: String,

    /// Take part in elections (false = observe only)
    #[serde(default = "default_true")]
    pub participating: bool,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// Election name
    pub name: String,

    /// Namespace the election key lives under
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Coordination store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store server address
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Wait timeout in milliseconds (0 = wait indefinitely)
    #[serde(default)]
    pub wait_timeout_ms: u64,

    /// Idle connections kept per client
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Delay before a failed connection is reported, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Store server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the store server binds to
    #[serde(default = "default_server_address")]
    pub bind_address: String,

    /// Changes retained for waiters by the served store
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    crate::election::DEFAULT_NAMESPACE.to_string()
}

fn default_store_address() -> String {
    "127.0.0.1:8046".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_pool_size() -> usize {
    4
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_server_address() -> String {
    "0.0.0.0:8046".to_string()
}

fn default_history_limit() -> usize {
    crate::store::DEFAULT_HISTORY_LIMIT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            wait_timeout_ms: 0,
            pool_size: default_pool_size(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_address(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Logging settings for the binary: the config file's section when it
    /// can be read, with a command line level taking precedence
    pub fn resolve(config_path: &std::path::Path, level: Option<String>) -> Self {
        let mut logging = WolfElectConfig::from_file(config_path)
            .map(|config| config.logging)
            .unwrap_or_default();
        if let Some(level) = level {
            logging.level = level;
        }
        logging
    }
}

impl WolfElectConfig {
    /// Starting configuration for `wolfelect init`
    pub fn example(identity: &str) -> Self {
        Self {
            node: NodeConfig {
                identity: identity.to_string(),
                participating: true,
            },
            election: ElectionSection {
                name: "default".to_string(),
                namespace: default_namespace(),
            },
            store: StoreConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfElectConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.identity.is_empty() {
            return Err(crate::Error::Config("node.identity cannot be empty".into()));
        }

        if self.election.name.is_empty() {
            return Err(crate::Error::Config("election.name cannot be empty".into()));
        }

        if self.election.name.contains('/') {
            return Err(crate::Error::Config("election.name cannot contain '/'".into()));
        }

        if self.store.address.is_empty() {
            return Err(crate::Error::Config("store.address cannot be empty".into()));
        }

        if self.server.history_limit == 0 {
            return Err(crate::Error::Config("server.history_limit must be at least 1".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'compact', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Election settings for the client
    pub fn election_config(&self) -> ElectionConfig {
        let config = ElectionConfig::new(&self.election.name, &self.node.identity)
            .with_namespace(&self.election.namespace);
        if self.node.participating {
            config
        } else {
            config.observer()
        }
    }

    /// Full path of the election key
    pub fn election_path(&self) -> String {
        self.election_config().path()
    }

    /// Connection settings for the remote store
    pub fn remote_store_config(&self) -> RemoteStoreConfig {
        RemoteStoreConfig {
            address: self.store.address.clone(),
            connect_timeout: self.connect_timeout(),
            request_timeout: self.request_timeout(),
            wait_timeout: self.wait_timeout(),
            pool_size: self.store.pool_size,
            retry_delay: Duration::from_millis(self.store.retry_delay_ms),
        }
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.store.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.store.request_timeout_ms)
    }

    /// Get wait timeout as Duration, None when waits are unbounded
    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.store.wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
