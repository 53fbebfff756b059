//! Store Server
//!
//! TCP server exposing a coordination store to remote election clients.

use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_request, write_response, Request, Response};
use crate::error::{Error, Result};
use crate::store::CoordinationStore;

/// Network server for the coordination store
pub struct StoreServer {
    /// Bind address
    bind_address: String,
    /// Store answering the requests
    store: Arc<dyn CoordinationStore>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl StoreServer {
    /// Create a new store server
    pub fn new(bind_address: String, store: Arc<dyn CoordinationStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            store,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Store server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let store = Arc::clone(&self.store);
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), store, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Store server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Handle a single connection, one request at a time
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    store: Arc<dyn CoordinationStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request = match read_request(&mut reader).await {
            Ok(request) => request,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading request from {}: {}", peer_addr, e);
                break;
            }
        };

        let name = request.type_name();
        tracing::trace!("Received {} from {}", name, peer_addr);

        let response = tokio::select! {
            response = dispatch(store.as_ref(), request) => response,
            _ = shutdown_rx.changed() => Response::from_error(&Error::ShuttingDown),
            _ = peer_closed(&mut reader) => {
                // Client gave up (wait timeout or exit); drop the pending request
                tracing::debug!("{} closed the connection during {}", peer_addr, name);
                break;
            }
        };

        write_response(&mut writer, &response).await?;
        if *shutdown_rx.borrow() {
            break;
        }
    }

    Ok(())
}

/// Resolves once the peer has closed its end of the connection
async fn peer_closed(reader: &mut OwnedReadHalf) {
    let mut buf = [0u8; 1];
    match reader.peek(&mut buf).await {
        Ok(0) | Err(_) => {}
        // Pipelined request, picked up after the current one
        Ok(_) => std::future::pending().await,
    }
}

/// Run a request against the store
async fn dispatch(store: &dyn CoordinationStore, request: Request) -> Response {
    let result = match request {
        Request::Read { path } => store
            .read(&path)
            .await
            .map(|(body, revision)| Response::Value { body, revision }),
        Request::CurrentRevision => store.current_revision().await.map(Response::Revision),
        Request::CompareAndSwap { path, expected, value } => store
            .compare_and_swap(&path, expected, &value)
            .await
            .map(Response::Revision),
        Request::CompareAndDelete { path, expected } => store
            .compare_and_delete(&path, expected)
            .await
            .map(|()| Response::Deleted),
        Request::WaitForChange { path, since } => {
            store.wait_for_change(&path, since).await.map(Response::Event)
        }
        Request::Ping => Ok(Response::Pong),
    };

    result.unwrap_or_else(|e| Response::from_error(&e))
}
