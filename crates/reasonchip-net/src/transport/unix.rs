//! UNIX domain socket transports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stream::{spawn_client_connection, spawn_server_connection, ClientConnection, ConnectionMap};
use super::{ClientHandler, ClientTransport, ServerHandler, ServerTransport, TransportError};
use crate::protocol::Packet;

pub struct UnixServerTransport {
    path: PathBuf,
    cancel: Mutex<Option<CancellationToken>>,
    connections: ConnectionMap,
}

impl UnixServerTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cancel: Mutex::new(None),
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ServerTransport for UnixServerTransport {
    async fn start(&self, handler: Arc<dyn ServerHandler>) -> Result<(), TransportError> {
        // A stale socket file from an unclean exit blocks the bind.
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path)?;
        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let connections = self.connections.clone();
        let path = self.path.clone();
        tokio::spawn(async move {
            tracing::info!(path = %path.display(), "unix server listening");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let id = Uuid::new_v4();
                            tracing::debug!(conn = %id, "accepted connection");
                            spawn_server_connection(
                                stream,
                                id,
                                handler.clone(),
                                connections.clone(),
                                &cancel,
                            )
                            .await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
            let _ = std::fs::remove_file(&path);
            tracing::info!(path = %path.display(), "unix server stopped");
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        self.connections.write().await.clear();
    }

    async fn send_packet(&self, conn: Uuid, packet: Packet) -> Result<(), TransportError> {
        let tx = {
            let connections = self.connections.read().await;
            connections
                .get(&conn)
                .map(|handle| handle.tx.clone())
                .ok_or(TransportError::UnknownConnection(conn))?
        };
        tx.send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close_connection(&self, conn: Uuid) -> Result<(), TransportError> {
        let connections = self.connections.read().await;
        let handle = connections
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        handle.cancel.cancel();
        Ok(())
    }
}

pub struct UnixClientTransport {
    path: PathBuf,
    connection: Mutex<Option<ClientConnection>>,
}

impl UnixClientTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClientTransport for UnixClientTransport {
    async fn connect(&self, handler: Arc<dyn ClientHandler>) -> Result<(), TransportError> {
        let stream = UnixStream::connect(&self.path).await?;
        tracing::debug!(path = %self.path.display(), "connected");
        *self.connection.lock().await = Some(spawn_client_connection(stream, handler));
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.cancel.cancel();
        }
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        let tx = {
            let connection = self.connection.lock().await;
            connection
                .as_ref()
                .map(|c| c.tx.clone())
                .ok_or(TransportError::NotConnected)?
        };
        tx.send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
