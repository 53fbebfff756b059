//! Remote Store Client
//!
//! TCP client implementing [`CoordinationStore`] against a [`StoreServer`].
//!
//! [`StoreServer`]: super::StoreServer

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_response, write_request, Request, Response};
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, Event, Revision};

/// Connection settings for a remote store
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Store server address (host:port)
    pub address: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for ordinary requests
    pub request_timeout: Duration,
    /// Timeout for wait requests (None = block indefinitely)
    pub wait_timeout: Option<Duration>,
    /// Idle connections kept for reuse
    pub pool_size: usize,
    /// Pause before a failed connection attempt is reported
    pub retry_delay: Duration,
}

impl RemoteStoreConfig {
    /// Settings with default timeouts for the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            wait_timeout: None,
            pool_size: 4,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Coordination store reached over TCP
pub struct RemoteStore {
    config: RemoteStoreConfig,
    /// Idle connections
    pool: Mutex<Vec<TcpStream>>,
}

impl RemoteStore {
    /// Create a new remote store client. Connections are opened lazily.
    pub fn new(config: RemoteStoreConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Server address
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Check that the server answers
    pub async fn ping(&self) -> Result<()> {
        match self.call(Request::Ping, Some(self.config.request_timeout)).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected("Ping", &other)),
        }
    }

    /// Send a request and wait for its response, bounded by `limit`
    async fn call(&self, request: Request, limit: Option<Duration>) -> Result<Response> {
        let exchange = self.exchange(request);
        let response = match limit {
            Some(limit) => match timeout(limit, exchange).await {
                Ok(inner) => inner?,
                Err(_) => return Err(Error::ConnectionTimeout(self.config.address.clone())),
            },
            None => exchange.await?,
        };

        tracing::trace!("Received {} from {}", response.type_name(), self.config.address);
        Ok(response)
    }

    /// Send without timeout wrapper
    async fn exchange(&self, request: Request) -> Result<Response> {
        // Try an idle connection first
        if let Some(mut stream) = self.checkout().await {
            match self.round_trip(&mut stream, &request).await {
                Ok(response) => {
                    self.checkin(stream).await;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    // Usually the server restarted; the other idle connections are dead too
                    self.clear_pool().await;
                    if !request.is_idempotent() {
                        return Err(e);
                    }
                    tracing::debug!(
                        "Idle connection to {} is dead ({}), retrying {}",
                        self.config.address,
                        e,
                        request.type_name()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        // Create new connection
        let mut stream = self.connect().await?;
        let response = self.round_trip(&mut stream, &request).await?;
        self.checkin(stream).await;

        Ok(response)
    }

    async fn round_trip(&self, stream: &mut TcpStream, request: &Request) -> Result<Response> {
        write_request(stream, request).await?;
        read_response(stream).await
    }

    /// Connect to the server
    async fn connect(&self) -> Result<TcpStream> {
        let address = &self.config.address;
        let result = timeout(self.config.connect_timeout, TcpStream::connect(address)).await;

        let err = match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!("Connected to store at {}", address);
                return Ok(stream);
            }
            Ok(Err(e)) => Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            },
            Err(_) => Error::ConnectionTimeout(address.to_string()),
        };

        // Callers such as the election watch retry straight away
        tokio::time::sleep(self.config.retry_delay).await;
        Err(err)
    }

    /// Take an idle connection from the pool
    async fn checkout(&self) -> Option<TcpStream> {
        self.pool.lock().await.pop()
    }

    /// Drop all idle connections
    async fn clear_pool(&self) {
        let mut pool = self.pool.lock().await;
        if !pool.is_empty() {
            tracing::debug!("Dropping {} idle connections to {}", pool.len(), self.config.address);
            pool.clear();
        }
    }

    /// Return a connection to the pool
    async fn checkin(&self, stream: TcpStream) {
        let mut pool = self.pool.lock().await;
        if pool.len() < self.config.pool_size {
            pool.push(stream);
        }
    }
}

/// Error for a response that does not belong to the request
fn unexpected(request: &str, response: &Response) -> Error {
    Error::Protocol(format!(
        "Unexpected {} response to {}",
        response.type_name(),
        request
    ))
}

#[async_trait::async_trait]
impl CoordinationStore for RemoteStore {
    async fn read(&self, path: &str) -> Result<(Vec<u8>, Revision)> {
        let request = Request::Read { path: path.to_string() };
        match self.call(request, Some(self.config.request_timeout)).await? {
            Response::Value { body, revision } => Ok((body, revision)),
            Response::Error { code, message } => Err(Response::into_error(code, message, path)),
            other => Err(unexpected("Read", &other)),
        }
    }

    async fn current_revision(&self) -> Result<Revision> {
        match self.call(Request::CurrentRevision, Some(self.config.request_timeout)).await? {
            Response::Revision(revision) => Ok(revision),
            Response::Error { code, message } => Err(Response::into_error(code, message, "")),
            other => Err(unexpected("CurrentRevision", &other)),
        }
    }

    async fn compare_and_swap(&self, path: &str, expected: Revision, value: &[u8]) -> Result<Revision> {
        let request = Request::CompareAndSwap {
            path: path.to_string(),
            expected,
            value: value.to_vec(),
        };
        match self.call(request, Some(self.config.request_timeout)).await? {
            Response::Revision(revision) => Ok(revision),
            Response::Error { code, message } => Err(Response::into_error(code, message, path)),
            other => Err(unexpected("CompareAndSwap", &other)),
        }
    }

    async fn compare_and_delete(&self, path: &str, expected: Revision) -> Result<()> {
        let request = Request::CompareAndDelete {
            path: path.to_string(),
            expected,
        };
        match self.call(request, Some(self.config.request_timeout)).await? {
            Response::Deleted => Ok(()),
            Response::Error { code, message } => Err(Response::into_error(code, message, path)),
            other => Err(unexpected("CompareAndDelete", &other)),
        }
    }

    async fn wait_for_change(&self, path: &str, since: Revision) -> Result<Event> {
        let request = Request::WaitForChange {
            path: path.to_string(),
            since,
        };
        match self.call(request, self.config.wait_timeout).await? {
            Response::Event(event) => Ok(event),
            Response::Error { code, message } => Err(Response::into_error(code, message, path)),
            other => Err(unexpected("WaitForChange", &other)),
        }
    }
}
